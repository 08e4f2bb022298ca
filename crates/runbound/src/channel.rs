//! One-shot result channel from child to supervisor.
//!
//! The channel is a pipe carrying exactly one frame:
//!
//! ```text
//! +-----+----------------+-----------------+
//! | tag | length (u32 LE)| payload         |
//! +-----+----------------+-----------------+
//! ```
//!
//! - `S`: success, payload is the JSON encoded return value
//! - `A`: aborted, payload is a single [`AbortReason`] code
//! - `N`: no payload, the child gave up without a value
//!
//! Abort frames are fixed size and built on the stack so the signal handler
//! can emit them without allocating.

use crate::outcome::AbortReason;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use thiserror::Error;

const TAG_SUCCESS: u8 = b'S';
const TAG_ABORTED: u8 = b'A';
const TAG_NO_PAYLOAD: u8 = b'N';

const HEADER_LEN: usize = 5;

/// Largest success payload the supervisor accepts.
pub const MAX_PAYLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Size of an encoded abort frame.
pub(crate) const ABORT_FRAME_LEN: usize = HEADER_LEN + 1;

/// Problems decoding the channel contents.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),

    #[error("unknown abort reason code {0}")]
    UnknownReason(u8),

    #[error("frame of {0} bytes exceeds the payload limit")]
    Oversized(usize),

    #[error("{tag} frame has invalid length {len}")]
    BadLength { tag: char, len: usize },

    #[error("{0} trailing bytes after the frame")]
    TrailingBytes(usize),
}

/// A decoded child message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildMessage {
    /// JSON encoded return value.
    Success(Vec<u8>),
    Aborted(AbortReason),
    NoPayload,
}

/// Encode an abort frame without touching the heap.
pub(crate) const fn abort_frame(reason: AbortReason) -> [u8; ABORT_FRAME_LEN] {
    [TAG_ABORTED, 1, 0, 0, 0, reason.code()]
}

/// Encode a success frame around an already serialized payload.
pub(crate) fn success_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(TAG_SUCCESS);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Encode the "no payload" marker.
pub(crate) const fn no_payload_frame() -> [u8; HEADER_LEN] {
    [TAG_NO_PAYLOAD, 0, 0, 0, 0]
}

/// Incremental frame decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the channel.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered so far.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to decode the frame. Returns `Ok(None)` while incomplete.
    pub fn decode(&self) -> Result<Option<ChildMessage>, ChannelError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let tag = self.buf[0];
        let len = u32::from_le_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > MAX_PAYLOAD_BYTES {
            return Err(ChannelError::Oversized(len));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let extra = self.buf.len() - HEADER_LEN - len;
        if extra > 0 {
            return Err(ChannelError::TrailingBytes(extra));
        }

        let payload = &self.buf[HEADER_LEN..];
        match tag {
            TAG_SUCCESS => Ok(Some(ChildMessage::Success(payload.to_vec()))),
            TAG_ABORTED => {
                if len != 1 {
                    return Err(ChannelError::BadLength { tag: 'A', len });
                }
                AbortReason::from_code(payload[0])
                    .map(|reason| Some(ChildMessage::Aborted(reason)))
                    .ok_or(ChannelError::UnknownReason(payload[0]))
            }
            TAG_NO_PAYLOAD => {
                if len != 0 {
                    return Err(ChannelError::BadLength { tag: 'N', len });
                }
                Ok(Some(ChildMessage::NoPayload))
            }
            other => Err(ChannelError::UnknownTag(other)),
        }
    }
}

/// What a read pass over the channel produced.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadState {
    /// More bytes may still arrive.
    Pending,
    /// A complete frame was read.
    Message(ChildMessage),
    /// The write end closed before a complete frame arrived.
    Closed,
}

/// Supervisor side of the channel.
#[derive(Debug)]
pub struct ChannelReader {
    file: File,
    decoder: FrameDecoder,
}

impl ChannelReader {
    /// Switch the read end to non-blocking mode.
    pub(crate) fn set_nonblocking(&self) -> io::Result<()> {
        let fd = self.file.as_raw_fd();
        // SAFETY: fd is owned by self.file and stays open for the call
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Read whatever is available without blocking.
    pub fn drain(&mut self) -> Result<ReadState, ChannelError> {
        let mut chunk = [0u8; 8192];
        loop {
            match self.file.read(&mut chunk) {
                Ok(0) => {
                    return Ok(match self.decoder.decode()? {
                        Some(message) => ReadState::Message(message),
                        None => ReadState::Closed,
                    });
                }
                Ok(n) => {
                    self.decoder.extend(&chunk[..n]);
                    if self.decoder.buffered() > HEADER_LEN + MAX_PAYLOAD_BYTES {
                        return Err(ChannelError::Oversized(self.decoder.buffered()));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(match self.decoder.decode()? {
                        Some(message) => ReadState::Message(message),
                        None => ReadState::Pending,
                    });
                }
                Err(e) => {
                    tracing::debug!("Result channel read failed: {}", e);
                    return Ok(ReadState::Closed);
                }
            }
        }
    }
}

impl AsRawFd for ChannelReader {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Child side of the channel.
#[derive(Debug)]
pub struct ChannelWriter {
    file: File,
}

impl ChannelWriter {
    /// Send one frame. Returns `false` if the parent is already gone.
    ///
    /// Runs in the forked child, so it never logs.
    pub fn send(&mut self, frame: &[u8]) -> bool {
        self.file.write_all(frame).and_then(|_| self.file.flush()).is_ok()
    }
}

impl AsRawFd for ChannelWriter {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Create both endpoints. Both ends are close-on-exec so programs the work
/// executes never inherit them.
pub fn result_channel() -> io::Result<(ChannelReader, ChannelWriter)> {
    let mut fds = [0 as libc::c_int; 2];
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        // SAFETY: fds has room for the two descriptors pipe2 writes
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        // SAFETY: fds has room for the two descriptors pipe writes
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            // SAFETY: fd was just returned by pipe
            unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        }
    }

    // SAFETY: both descriptors are freshly created and owned by nobody else
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((
        ChannelReader {
            file: File::from(read),
            decoder: FrameDecoder::new(),
        },
        ChannelWriter {
            file: File::from(write),
        },
    ))
}
