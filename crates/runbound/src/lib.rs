//! Resource-bounded execution of a unit of work in a child process.
//!
//! A call to [`execute`] forks a child in its own process group, installs
//! the requested ceilings there, runs the work, and sends exactly one
//! result back over a pipe. The parent waits with an optional wall clock
//! deadline and always reclaims the child:
//!
//! - Memory: `RLIMIT_AS`; allocation failure is reported as an abort
//! - CPU time: `RLIMIT_CPU`; `SIGXCPU` is reported as an abort
//! - Wall time: an in-child alarm plus a supervisor deadline that
//!   terminates the whole process group, then kills it after a grace period
//! - Processes/threads: `RLIMIT_NPROC`; `EAGAIN` is reported as an abort
//!
//! ```rust,no_run
//! use runbound::{execute, ExecutionOutcome, ResourceLimits};
//!
//! let limits = ResourceLimits::new().with_memory(50_000_000).with_wall_time(2);
//! let outcome = execute(|()| Ok::<_, anyhow::Error>(6 * 7), (), &limits).unwrap();
//! assert_eq!(outcome, ExecutionOutcome::Success(42));
//! ```
//!
//! Requires POSIX signals and process groups. The child is created with
//! `fork(2)`: only the calling thread exists in it.

pub mod adapter;
pub mod error;
pub mod limits;
pub mod outcome;

#[cfg(unix)]
pub mod channel;
#[cfg(unix)]
pub mod child;
#[cfg(unix)]
pub mod runtime;
#[cfg(unix)]
pub mod supervisor;

#[cfg(target_os = "linux")]
pub mod linux;

pub use adapter::LimitedFn;
pub use error::{ExecError, LimitsError};
pub use limits::ResourceLimits;
pub use outcome::{AbortReason, ExecutionOutcome, FailureKind};

#[cfg(unix)]
pub use child::ExecutionRequest;
#[cfg(unix)]
pub use runtime::execute_async;
#[cfg(unix)]
pub use supervisor::{execute, ChildHandle, ExitInfo};

/// Result type for runbound operations.
pub type Result<T> = std::result::Result<T, ExecError>;

/// Resource-bounded execution needs POSIX process control.
#[cfg(not(unix))]
pub fn execute<F, A, R, E>(
    _function: F,
    _arguments: A,
    _limits: &ResourceLimits,
) -> Result<ExecutionOutcome<R>>
where
    F: FnOnce(A) -> std::result::Result<R, E>,
    R: serde::Serialize + serde::de::DeserializeOwned,
    E: Into<anyhow::Error>,
{
    Err(ExecError::UnsupportedPlatform)
}
