//! Parent-side supervisor: spawn the child, wait for its result or the
//! deadline, escalate termination, and reap it.
//!
//! Lifecycle of one call:
//!
//! ```text
//! Spawning -> Running -> Completed | TimedOut | Crashed -> Reaped
//! ```
//!
//! The only suspension point is a single `poll(2)` over the result channel
//! and, on Linux, a `pidfd` for the child. Without a `pidfd` the child's
//! exit is probed with `waitpid(WNOHANG)` every 100 ms.

use crate::channel::{result_channel, ChannelReader, ChildMessage, ReadState};
use crate::child::{self, ExecutionRequest};
use crate::error::ExecError;
use crate::limits::ResourceLimits;
use crate::outcome::{AbortReason, ExecutionOutcome};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::{fork, setpgid, ForkResult, Pid};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const EXIT_PROBE_INTERVAL: Duration = Duration::from_millis(100);
const GROUP_PROBE_INTERVAL: Duration = Duration::from_millis(20);

/// How the child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code for a normal exit.
    pub code: Option<i32>,
    /// Signal number if the child was killed.
    pub signal: Option<i32>,
    /// User plus system CPU time consumed by the child.
    pub cpu_time: Duration,
}

impl ExitInfo {
    fn from_wait(pid: Pid, status: libc::c_int, usage: &libc::rusage) -> Self {
        let cpu_time = timeval_to_duration(usage.ru_utime) + timeval_to_duration(usage.ru_stime);
        match WaitStatus::from_raw(pid, status) {
            Ok(WaitStatus::Exited(_, code)) => Self {
                code: Some(code),
                signal: None,
                cpu_time,
            },
            Ok(WaitStatus::Signaled(_, signal, _)) => Self {
                code: None,
                signal: Some(signal as i32),
                cpu_time,
            },
            other => {
                debug!("Unexpected wait status for {}: {:?}", pid, other);
                Self::unknown()
            }
        }
    }

    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
            cpu_time: Duration::ZERO,
        }
    }

    /// Whether the child exited with status 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit code, or the negated signal number for a killed child.
    pub fn as_exit_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => -signal,
            (None, None) => -1,
        }
    }
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// Supervisor-owned reference to a spawned child.
///
/// Dropping a handle whose child is still alive kills the child's process
/// group and reaps the child.
#[derive(Debug)]
pub struct ChildHandle {
    pid: Pid,
    pgid: Pid,
    alive: bool,
    exit: Option<ExitInfo>,
    pidfd: Option<OwnedFd>,
}

impl ChildHandle {
    fn new(pid: Pid) -> Self {
        // The child calls setpgid too; whichever runs first wins and the
        // other sees EACCES (child already exec'd) or a no-op.
        if let Err(e) = setpgid(pid, pid) {
            if e != Errno::EACCES && e != Errno::ESRCH {
                debug!("setpgid({}) from parent failed: {}", pid, e);
            }
        }

        Self {
            pid,
            pgid: pid,
            alive: true,
            exit: None,
            pidfd: open_pidfd(pid),
        }
    }

    /// Process id of the child.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Process group id captured at spawn time.
    pub fn pgid(&self) -> Pid {
        self.pgid
    }

    /// Whether the child has not been reaped yet.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    fn wait4(&mut self, flags: libc::c_int) -> Option<ExitInfo> {
        if let Some(exit) = self.exit {
            return Some(exit);
        }

        let mut status: libc::c_int = 0;
        // SAFETY: rusage is plain old data
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        loop {
            // SAFETY: both out-pointers reference live locals
            let rc = unsafe { libc::wait4(self.pid.as_raw(), &mut status, flags, &mut usage) };
            if rc == self.pid.as_raw() {
                let exit = ExitInfo::from_wait(self.pid, status, &usage);
                self.record(exit);
                return Some(exit);
            }
            if rc == 0 {
                return None;
            }
            match Errno::last() {
                Errno::EINTR => continue,
                errno => {
                    // ECHILD: reaped elsewhere, e.g. SIGCHLD set to SIG_IGN
                    warn!("Cannot collect exit status of child {}: {}", self.pid, errno);
                    let exit = ExitInfo::unknown();
                    self.record(exit);
                    return Some(exit);
                }
            }
        }
    }

    fn record(&mut self, exit: ExitInfo) {
        self.exit = Some(exit);
        self.alive = false;
    }

    /// Reap the child if it has already exited.
    pub fn try_reap(&mut self) -> Option<ExitInfo> {
        self.wait4(libc::WNOHANG)
    }

    /// Block until the child exits and reap it.
    pub fn reap(&mut self) -> ExitInfo {
        self.wait4(0).unwrap_or_else(ExitInfo::unknown)
    }

    /// Wait for the child to exit, giving up at `deadline`.
    pub fn wait_exit(&mut self, deadline: Option<Instant>) -> Option<ExitInfo> {
        loop {
            if let Some(exit) = self.try_reap() {
                return Some(exit);
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    Some(remaining)
                }
                None => None,
            };

            let pidfd = self.pidfd.as_ref().map(|fd| fd.as_raw_fd());
            match (pidfd, remaining) {
                (Some(pidfd), _) => {
                    let mut fds = [readable(pidfd)];
                    if let Err(e) = poll_fds(&mut fds, remaining) {
                        warn!("poll on child {} failed: {}", self.pid, e);
                        thread::sleep(EXIT_PROBE_INTERVAL);
                    }
                }
                (None, None) => return Some(self.reap()),
                (None, Some(remaining)) => thread::sleep(remaining.min(EXIT_PROBE_INTERVAL)),
            }
        }
    }

    /// Send `signal` to the child's process group.
    ///
    /// Returns `false` when the group no longer exists, which is not an error.
    pub fn signal_group(&self, signal: Signal) -> bool {
        match killpg(self.pgid, signal) {
            Ok(()) => true,
            Err(Errno::ESRCH) => {
                debug!("Process group {} already gone, {} not sent", self.pgid, signal);
                false
            }
            Err(e) => {
                warn!("Failed to send {} to process group {}: {}", signal, self.pgid, e);
                false
            }
        }
    }

    fn group_exists(&self) -> bool {
        !matches!(killpg(self.pgid, None), Err(Errno::ESRCH))
    }

    /// Ask the whole group to stop, wait up to `grace`, then `SIGKILL` any
    /// member still present and reap the child.
    pub fn terminate_group(&mut self, grace: Duration) -> ExitInfo {
        let deadline = Instant::now() + grace;
        self.signal_group(Signal::SIGTERM);

        let exit = self.wait_exit(Some(deadline));
        // descendants may outlive the child
        while exit.is_some() && self.group_exists() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            thread::sleep(remaining.min(GROUP_PROBE_INTERVAL));
        }

        if self.group_exists() {
            warn!(
                "Process group {} survived SIGTERM for {:?}, sending SIGKILL",
                self.pgid, grace
            );
            self.signal_group(Signal::SIGKILL);
        }

        exit.unwrap_or_else(|| self.reap())
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        if self.alive {
            self.signal_group(Signal::SIGKILL);
            self.reap();
        }
    }
}

#[cfg(target_os = "linux")]
fn open_pidfd(pid: Pid) -> Option<OwnedFd> {
    match crate::linux::pidfd_open(pid) {
        Ok(fd) => Some(fd),
        Err(e) => {
            debug!("pidfd unavailable ({}), probing child exit instead", e);
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn open_pidfd(_pid: Pid) -> Option<OwnedFd> {
    None
}

fn readable(fd: libc::c_int) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}

/// Poll until a descriptor is ready or `timeout` passes. `None` blocks.
fn poll_fds(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    let timeout_ms = match timeout {
        Some(timeout) => timeout.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as libc::c_int,
        None => -1,
    };
    // SAFETY: fds is a valid, exclusively borrowed slice of pollfd
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(rc as usize)
}

/// Per-call lifecycle phase, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Completed,
    TimedOut,
    Crashed,
}

enum Wake {
    Message(ChildMessage),
    Closed,
    ChildExited,
    Deadline,
}

struct Supervisor<'a> {
    handle: ChildHandle,
    reader: ChannelReader,
    limits: &'a ResourceLimits,
    deadline: Option<Instant>,
    phase: Phase,
}

impl<'a> Supervisor<'a> {
    fn new(
        handle: ChildHandle,
        reader: ChannelReader,
        limits: &'a ResourceLimits,
        started: Instant,
    ) -> Self {
        let supervisor = Self {
            handle,
            reader,
            limits,
            deadline: limits.wall_timeout().map(|timeout| started + timeout),
            phase: Phase::Running,
        };
        debug!("Child {} is {:?}", supervisor.handle.pid(), supervisor.phase);
        supervisor
    }

    fn transition(&mut self, phase: Phase) {
        debug!("Child {}: {:?} -> {:?}", self.handle.pid(), self.phase, phase);
        self.phase = phase;
    }

    fn run<R: DeserializeOwned>(mut self) -> ExecutionOutcome<R> {
        match self.wait_for_event() {
            Wake::Message(message) => self.complete(Some(message)),
            Wake::Closed => self.complete(None),
            Wake::ChildExited => {
                let message = self.drain_after_exit();
                self.complete(message)
            }
            Wake::Deadline => self.time_out(),
        }
    }

    fn wait_for_event(&mut self) -> Wake {
        loop {
            let remaining = match self.deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Wake::Deadline;
                    }
                    Some(remaining)
                }
                None => None,
            };

            let mut fds = Vec::with_capacity(2);
            fds.push(readable(self.reader.as_raw_fd()));
            let timeout = match &self.handle.pidfd {
                Some(pidfd) => {
                    fds.push(readable(pidfd.as_raw_fd()));
                    remaining
                }
                None => Some(remaining.map_or(EXIT_PROBE_INTERVAL, |r| r.min(EXIT_PROBE_INTERVAL))),
            };

            if let Err(e) = poll_fds(&mut fds, timeout) {
                warn!("poll on result channel failed: {}", e);
                thread::sleep(EXIT_PROBE_INTERVAL);
                continue;
            }

            if fds[0].revents != 0 {
                match self.reader.drain() {
                    Ok(ReadState::Message(message)) => return Wake::Message(message),
                    Ok(ReadState::Closed) => return Wake::Closed,
                    Ok(ReadState::Pending) => {}
                    Err(e) => {
                        warn!("Discarding malformed result from child {}: {}", self.handle.pid(), e);
                        return Wake::Closed;
                    }
                }
            }

            let exited = match fds.get(1) {
                Some(pidfd) => pidfd.revents != 0,
                None => self.handle.try_reap().is_some(),
            };
            if exited {
                debug!("Child {} died before reporting", self.handle.pid());
                return Wake::ChildExited;
            }
        }
    }

    /// Collect whatever the child wrote before it died. A partial frame
    /// counts as nothing.
    fn drain_after_exit(&mut self) -> Option<ChildMessage> {
        match self.reader.drain() {
            Ok(ReadState::Message(message)) => Some(message),
            Ok(_) => None,
            Err(e) => {
                warn!("Discarding malformed result from child {}: {}", self.handle.pid(), e);
                None
            }
        }
    }

    fn complete<R: DeserializeOwned>(mut self, message: Option<ChildMessage>) -> ExecutionOutcome<R> {
        let exit = match self.handle.wait_exit(self.deadline) {
            Some(exit) => exit,
            None => {
                warn!("Child {} did not exit before the deadline", self.handle.pid());
                self.handle.terminate_group(self.limits.grace_period())
            }
        };
        debug!("Child {} exited: {:?}", self.handle.pid(), exit);
        self.classify(message, exit)
    }

    fn classify<R: DeserializeOwned>(
        &mut self,
        message: Option<ChildMessage>,
        exit: ExitInfo,
    ) -> ExecutionOutcome<R> {
        if !exit.success() {
            if message.is_none() && self.cpu_limit_explains(&exit) {
                self.transition(Phase::Completed);
                warn!(
                    "Child {} killed after {:?} of CPU time",
                    self.handle.pid(),
                    exit.cpu_time
                );
                return ExecutionOutcome::Aborted(AbortReason::CpuTime);
            }
            self.transition(Phase::Crashed);
            warn!(
                "Child {} exited abnormally ({}), discarding any result",
                self.handle.pid(),
                exit.as_exit_code()
            );
            return ExecutionOutcome::CrashedExitCode(exit.as_exit_code());
        }

        match message {
            Some(ChildMessage::Success(payload)) => match serde_json::from_slice(&payload) {
                Ok(value) => {
                    self.transition(Phase::Completed);
                    ExecutionOutcome::Success(value)
                }
                Err(e) => {
                    self.transition(Phase::Crashed);
                    warn!("Child {} returned an undecodable result: {}", self.handle.pid(), e);
                    ExecutionOutcome::CrashedExitCode(0)
                }
            },
            Some(ChildMessage::Aborted(AbortReason::WallTime)) => {
                // the child's own alarm beat the supervisor's deadline
                self.transition(Phase::TimedOut);
                self.handle.terminate_group(self.limits.grace_period());
                ExecutionOutcome::TimedOut
            }
            Some(ChildMessage::Aborted(reason)) => {
                self.transition(Phase::Completed);
                warn!("Call aborted in child {}: {}", self.handle.pid(), reason);
                ExecutionOutcome::Aborted(reason)
            }
            Some(ChildMessage::NoPayload) | None => {
                self.transition(Phase::Crashed);
                warn!("Child {} exited without a result", self.handle.pid());
                ExecutionOutcome::CrashedExitCode(0)
            }
        }
    }

    fn cpu_limit_explains(&self, exit: &ExitInfo) -> bool {
        let killed = matches!(exit.signal, Some(libc::SIGKILL) | Some(libc::SIGXCPU));
        killed
            && self
                .limits
                .cpu_seconds
                .map_or(false, |secs| exit.cpu_time >= Duration::from_secs(secs))
    }

    fn time_out<R>(mut self) -> ExecutionOutcome<R> {
        self.transition(Phase::TimedOut);
        warn!(
            "Call exceeded {}s of wall time, terminating process group {}",
            self.limits.wall_seconds.unwrap_or_default(),
            self.handle.pgid()
        );
        let exit = self.handle.terminate_group(self.limits.grace_period());
        debug!("Timed out child {} ended with {:?}", self.handle.pid(), exit);
        ExecutionOutcome::TimedOut
    }
}

/// Whether the child may take stdio and logging locks after the fork.
///
/// A lock held by another parent thread at fork time is never released in
/// the child, so only a single-threaded parent gets child diagnostics.
#[cfg(target_os = "linux")]
fn child_may_log() -> bool {
    match crate::linux::thread_count() {
        Ok(1) => true,
        Ok(threads) => {
            debug!(
                "Forking from a process with {} threads; the child stays silent",
                threads
            );
            false
        }
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
fn child_may_log() -> bool {
    false
}

/// Run `function(arguments)` in a child process under `limits`.
///
/// Returns `Err` only when no child could be started. Every failure after
/// that point, including panics and errors inside `function`, is reported
/// as an [`ExecutionOutcome`].
pub fn execute<F, A, R, E>(
    function: F,
    arguments: A,
    limits: &ResourceLimits,
) -> Result<ExecutionOutcome<R>, ExecError>
where
    F: FnOnce(A) -> Result<R, E>,
    R: Serialize + DeserializeOwned,
    E: Into<anyhow::Error>,
{
    limits.validate()?;
    limits.announce();
    let diagnostics = child_may_log();

    let (reader, writer) = result_channel().map_err(ExecError::Channel)?;
    reader.set_nonblocking().map_err(ExecError::Channel)?;
    let request = ExecutionRequest::new(function, arguments);
    let started = Instant::now();

    // SAFETY: the child only runs the work and leaves through _exit
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(reader);
            child::run_child(request, limits, writer, diagnostics)
        }
        Ok(ForkResult::Parent { child }) => {
            drop(writer);
            debug!("Spawned child {}", child);
            let handle = ChildHandle::new(child);
            Ok(Supervisor::new(handle, reader, limits, started).run())
        }
        Err(errno) => Err(ExecError::Spawn(io::Error::from(errno))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_convention() {
        let exited = ExitInfo {
            code: Some(3),
            signal: None,
            cpu_time: Duration::ZERO,
        };
        assert_eq!(exited.as_exit_code(), 3);
        assert!(!exited.success());

        let killed = ExitInfo {
            code: None,
            signal: Some(libc::SIGKILL),
            cpu_time: Duration::ZERO,
        };
        assert_eq!(killed.as_exit_code(), -libc::SIGKILL);
    }

    #[test]
    fn test_execute_returns_value() {
        let outcome = execute(|()| Ok::<_, anyhow::Error>(6 * 7), (), &ResourceLimits::new()).unwrap();
        assert_eq!(outcome, ExecutionOutcome::Success(42));
    }

    #[test]
    fn test_execute_rejects_invalid_limits() {
        let limits = ResourceLimits::new().with_wall_time(0);
        let result = execute(|()| Ok::<_, anyhow::Error>(()), (), &limits);
        assert!(matches!(result, Err(ExecError::Limits(_))));
    }

    #[test]
    fn test_child_handle_reaps_and_ignores_late_signals() {
        let outcome = execute(|()| Ok::<_, anyhow::Error>("done".to_string()), (), &ResourceLimits::new())
            .unwrap();
        assert_eq!(outcome.success().as_deref(), Some("done"));

        // SAFETY: the child exits immediately
        let pid = match unsafe { fork() }.unwrap() {
            ForkResult::Child => unsafe { libc::_exit(0) },
            ForkResult::Parent { child } => child,
        };
        let mut handle = ChildHandle::new(pid);
        let exit = handle.reap();
        assert!(exit.success());
        assert!(!handle.is_alive());
        assert!(!handle.signal_group(Signal::SIGTERM));
        assert_eq!(handle.try_reap(), Some(exit));
    }

    #[test]
    fn test_drop_kills_running_child() {
        // SAFETY: the child only sleeps
        let pid = match unsafe { fork() }.unwrap() {
            ForkResult::Child => loop {
                unsafe { libc::pause() };
            },
            ForkResult::Parent { child } => child,
        };
        let handle = ChildHandle::new(pid);
        drop(handle);
        assert!(matches!(
            nix::sys::signal::kill(pid, None),
            Err(Errno::ESRCH)
        ));
    }
}
