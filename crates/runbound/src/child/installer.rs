//! Limit installer, run in the child before any work executes.

use super::abort;
use crate::limits::ResourceLimits;
use nix::errno::Errno;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{alarm, setpgid, Pid};
use std::os::fd::RawFd;
use thiserror::Error;

/// Extra CPU seconds between the soft limit (`SIGXCPU`) and the hard limit
/// (`SIGKILL`). With equal limits Linux delivers `SIGKILL` first and the
/// abort path never runs.
pub const CPU_HARD_LIMIT_SLACK_SECS: u64 = 1;

/// Signals that request termination from outside the child.
const TERMINATION_SIGNALS: [Signal; 4] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGQUIT,
];

/// Failures that stop the child before the work runs.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("failed to create process group: {0}")]
    ProcessGroup(#[source] Errno),

    #[error("failed to set {resource}: {source}")]
    Rlimit {
        resource: &'static str,
        #[source]
        source: Errno,
    },

    #[error("failed to install handler for {signal}: {source}")]
    Signal {
        signal: Signal,
        #[source]
        source: Errno,
    },
}

/// Apply every configured ceiling and register the abort handler.
///
/// Either all limits are in force when this returns `Ok`, or the child must
/// not run the work.
pub fn install(limits: &ResourceLimits, channel_fd: RawFd) -> Result<(), InstallError> {
    setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(InstallError::ProcessGroup)?;

    if let Some(bytes) = limits.memory_bytes {
        set_limit(Resource::RLIMIT_AS, "RLIMIT_AS", bytes, bytes)?;
    }
    if let Some(count) = limits.max_processes {
        set_limit(Resource::RLIMIT_NPROC, "RLIMIT_NPROC", count, count)?;
    }
    if let Some(secs) = limits.cpu_seconds {
        let (_, inherited_hard) = getrlimit(Resource::RLIMIT_CPU).map_err(|source| {
            InstallError::Rlimit {
                resource: "RLIMIT_CPU",
                source,
            }
        })?;
        let hard = secs
            .saturating_add(CPU_HARD_LIMIT_SLACK_SECS)
            .min(inherited_hard as u64);
        set_limit(Resource::RLIMIT_CPU, "RLIMIT_CPU", secs, hard)?;
    }

    abort::arm(channel_fd);
    // a vanished parent must surface as EPIPE, not kill the child
    install_handler(Signal::SIGPIPE, SigHandler::SigIgn)?;
    let handler = SigHandler::Handler(abort::on_abort_signal);
    install_handler(Signal::SIGXCPU, handler)?;
    for signal in TERMINATION_SIGNALS {
        install_handler(signal, handler)?;
    }
    if limits.memory_bytes.is_some() {
        install_handler(Signal::SIGABRT, handler)?;
    }
    if let Some(secs) = limits.wall_seconds {
        install_handler(Signal::SIGALRM, handler)?;
        alarm::set(secs as u32);
    }
    Ok(())
}

fn set_limit(
    resource: Resource,
    name: &'static str,
    soft: u64,
    hard: u64,
) -> Result<(), InstallError> {
    setrlimit(resource, soft as _, hard as _).map_err(|source| InstallError::Rlimit {
        resource: name,
        source,
    })
}

fn install_handler(signal: Signal, handler: SigHandler) -> Result<(), InstallError> {
    let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
    // SAFETY: the handler only uses async-signal-safe operations
    unsafe { sigaction(signal, &action) }
        .map(|_| ())
        .map_err(|source| InstallError::Signal { signal, source })
}
