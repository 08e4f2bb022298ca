//! Outcomes of a bounded call and the failure taxonomy behind them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why the child abandoned the unit of work before it returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// An allocation failed under the address-space ceiling.
    MemoryLimit,
    /// The CPU time ceiling was reached (`SIGXCPU`).
    CpuTime,
    /// The in-child wall clock alarm fired (`SIGALRM`).
    WallTime,
    /// Creating a process or thread was refused (`EAGAIN`).
    ProcessLimit,
    /// Termination was requested from outside the child.
    Terminated,
}

impl AbortReason {
    /// Wire code used by the result channel.
    pub(crate) const fn code(self) -> u8 {
        match self {
            Self::MemoryLimit => 1,
            Self::CpuTime => 2,
            Self::WallTime => 3,
            Self::ProcessLimit => 4,
            Self::Terminated => 5,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::MemoryLimit),
            2 => Some(Self::CpuTime),
            3 => Some(Self::WallTime),
            4 => Some(Self::ProcessLimit),
            5 => Some(Self::Terminated),
            _ => None,
        }
    }

    /// Human readable cause.
    pub fn message(self) -> &'static str {
        match self {
            Self::MemoryLimit => "memory limit exceeded",
            Self::CpuTime => "CPU time exceeded",
            Self::WallTime => "wall-clock time exceeded",
            Self::ProcessLimit => "process/thread limit exceeded",
            Self::Terminated => "terminated by request",
        }
    }

    /// Taxonomy entry for this reason.
    pub fn failure_kind(self) -> FailureKind {
        match self {
            Self::MemoryLimit => FailureKind::MemoryExceeded,
            Self::CpuTime => FailureKind::CpuTimeExceeded,
            Self::WallTime => FailureKind::WallTimeExceeded,
            Self::ProcessLimit => FailureKind::ProcessLimitExceeded,
            Self::Terminated => FailureKind::Terminated,
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Named failure classes a bounded call can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MemoryExceeded,
    CpuTimeExceeded,
    WallTimeExceeded,
    ProcessLimitExceeded,
    /// The work failed in a way no ceiling explains.
    UserFunctionFailure,
    /// The child exited non-zero without an attributable cause.
    ChildCrashed,
    /// The supervisor's deadline passed without a message.
    TimedOut,
    /// Someone other than the supervisor asked the child to stop.
    Terminated,
}

/// The single result of a bounded call.
///
/// `CrashedExitCode` carries the child's exit code, or the negated signal
/// number when the child was killed by a signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum ExecutionOutcome<R> {
    Success(R),
    Aborted(AbortReason),
    CrashedExitCode(i32),
    TimedOut,
}

impl<R> ExecutionOutcome<R> {
    /// Check if the work returned a value.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// The returned value, if any.
    pub fn success(self) -> Option<R> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    /// Abort reason, if the child aborted.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Self::Aborted(reason) => Some(*reason),
            _ => None,
        }
    }

    /// Failure class, or `None` on success.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success(_) => None,
            Self::Aborted(reason) => Some(reason.failure_kind()),
            Self::CrashedExitCode(_) => Some(FailureKind::ChildCrashed),
            Self::TimedOut => Some(FailureKind::TimedOut),
        }
    }

    /// Transform the success value.
    pub fn map<T>(self, f: impl FnOnce(R) -> T) -> ExecutionOutcome<T> {
        match self {
            Self::Success(value) => ExecutionOutcome::Success(f(value)),
            Self::Aborted(reason) => ExecutionOutcome::Aborted(reason),
            Self::CrashedExitCode(code) => ExecutionOutcome::CrashedExitCode(code),
            Self::TimedOut => ExecutionOutcome::TimedOut,
        }
    }

    /// Convert into a `Result`, keeping the failure class on error.
    pub fn into_result(self) -> Result<R, FailureKind> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Aborted(reason) => Err(reason.failure_kind()),
            Self::CrashedExitCode(_) => Err(FailureKind::ChildCrashed),
            Self::TimedOut => Err(FailureKind::TimedOut),
        }
    }
}

impl<R: fmt::Debug> fmt::Display for ExecutionOutcome<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(value) => write!(f, "success: {:?}", value),
            Self::Aborted(reason) => write!(f, "aborted: {}", reason),
            Self::CrashedExitCode(code) if *code < 0 => {
                write!(f, "crashed: killed by signal {}", -code)
            }
            Self::CrashedExitCode(code) => write!(f, "crashed: exit code {}", code),
            Self::TimedOut => f.write_str("timed out"),
        }
    }
}
