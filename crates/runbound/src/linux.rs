//! Linux-specific process helpers.

#![cfg(target_os = "linux")]

use std::fs;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};

use nix::unistd::Pid;

/// Open a pollable descriptor that becomes readable when `pid` exits.
pub fn pidfd_open(pid: Pid) -> io::Result<OwnedFd> {
    // SAFETY: plain syscall with no pointer arguments
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the kernel returned a new descriptor we now own
    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

/// Returns the number of threads in the current process.
pub fn thread_count() -> io::Result<usize> {
    let status = fs::read_to_string("/proc/self/status")?;
    let (_, tail) = status
        .split_once("Threads:")
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing thread count"))?;
    let count = tail
        .split_whitespace()
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed thread count"))?;
    count
        .parse::<usize>()
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))
}
