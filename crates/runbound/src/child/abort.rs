//! Abort protocol: async signal handling and error classification.
//!
//! The signal handler is the only code that may run at an arbitrary
//! instruction boundary. It touches nothing but atomics, the thread's panic
//! counter, a stack buffer, `write(2)` and `_exit(2)`.
//!
//! Processes the work forks inherit the handler and the channel descriptor.
//! Only the process that armed the protocol may write an outcome; any other
//! process falls back to the default action for the signal.

use crate::channel::{abort_frame, no_payload_frame};
use crate::outcome::AbortReason;
use std::collections::TryReserveError;
use std::io;
use std::os::fd::RawFd;
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;

/// Exit code of a child whose work failed without an attributable cause.
pub const USER_FAILURE_EXIT: i32 = 1;

static CHANNEL_FD: AtomicI32 = AtomicI32::new(-1);
static OUTCOME_CLAIMED: AtomicBool = AtomicBool::new(false);
static OWNER_PID: AtomicI32 = AtomicI32::new(0);

/// Point the handler at the child's channel endpoint and make the calling
/// process the only one allowed to write the outcome.
pub(crate) fn arm(channel_fd: RawFd) {
    // SAFETY: getpid has no preconditions
    OWNER_PID.store(unsafe { libc::getpid() }, Ordering::SeqCst);
    CHANNEL_FD.store(channel_fd, Ordering::SeqCst);
}

fn is_owner() -> bool {
    // SAFETY: getpid is async-signal-safe
    OWNER_PID.load(Ordering::SeqCst) == unsafe { libc::getpid() }
}

/// Take the right to write the outcome. Succeeds at most once, and only in
/// the process that armed the protocol.
pub(crate) fn claim_outcome() -> bool {
    is_owner()
        && OUTCOME_CLAIMED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
}

/// Map an abort-triggering signal to its reason.
pub(crate) fn reason_for_signal(signum: libc::c_int) -> AbortReason {
    match signum {
        libc::SIGXCPU => AbortReason::CpuTime,
        libc::SIGALRM => AbortReason::WallTime,
        // only installed when a memory ceiling is set; alloc failure aborts
        libc::SIGABRT => AbortReason::MemoryLimit,
        _ => AbortReason::Terminated,
    }
}

pub(crate) extern "C" fn on_abort_signal(signum: libc::c_int) {
    if !is_owner() {
        // a descendant of the work: die the way it would without us
        // SAFETY: signal and raise are async-signal-safe; the re-raised
        // signal stays blocked until this handler returns
        unsafe {
            libc::signal(signum, libc::SIG_DFL);
            libc::raise(signum);
        }
        return;
    }

    // abort() delivers SIGABRT to the calling thread, so this reads the
    // panic count of the thread that aborted
    if signum == libc::SIGABRT && thread::panicking() {
        if claim_outcome() {
            write_raw(&no_payload_frame());
        }
        // SAFETY: _exit is async-signal-safe
        unsafe { libc::_exit(USER_FAILURE_EXIT) };
    }

    if !claim_outcome() {
        // the normal path already owns the channel and is about to exit
        return;
    }

    write_raw(&abort_frame(reason_for_signal(signum)));
    // SAFETY: _exit is async-signal-safe
    unsafe { libc::_exit(0) };
}

fn write_raw(mut bytes: &[u8]) {
    let fd = CHANNEL_FD.load(Ordering::SeqCst);
    if fd < 0 {
        return;
    }
    while !bytes.is_empty() {
        // SAFETY: bytes points to a live stack buffer of the given length
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if n < 0 {
            if io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

/// Keep the default panic report only when it is safe to take the stderr
/// lock in this process.
pub(crate) fn install_panic_hook(report: bool) {
    if !report {
        panic::set_hook(Box::new(|_| {}));
    }
}

/// Attribute a failure returned by the work to a ceiling, if one explains it.
pub fn classify_error(err: &anyhow::Error) -> Option<AbortReason> {
    for cause in err.chain() {
        if cause.downcast_ref::<TryReserveError>().is_some() {
            return Some(AbortReason::MemoryLimit);
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if let Some(reason) = classify_os_error(io_err) {
                return Some(reason);
            }
        }
        if let Some(errno) = cause.downcast_ref::<nix::errno::Errno>() {
            if let Some(reason) = classify_errno(*errno as i32) {
                return Some(reason);
            }
        }
    }
    None
}

fn classify_os_error(err: &io::Error) -> Option<AbortReason> {
    if err.kind() == io::ErrorKind::OutOfMemory {
        return Some(AbortReason::MemoryLimit);
    }
    err.raw_os_error().and_then(classify_errno)
}

fn classify_errno(errno: i32) -> Option<AbortReason> {
    match errno {
        libc::ENOMEM => Some(AbortReason::MemoryLimit),
        libc::EAGAIN => Some(AbortReason::ProcessLimit),
        _ => None,
    }
}
