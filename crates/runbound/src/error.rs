//! Runbound error types.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating [`ResourceLimits`](crate::ResourceLimits).
#[derive(Debug, Error)]
pub enum LimitsError {
    /// Limits file does not exist.
    #[error("Limits file not found: {0}")]
    NotFound(PathBuf),

    /// I/O error while reading a limits file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Limits file is not valid JSON5.
    #[error("JSON5 parse error: {0}")]
    Json5(String),

    /// Serializing limits failed.
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// One or more ceilings are unusable.
    #[error("Invalid limits: {}", .0.join("; "))]
    Validation(Vec<String>),
}

/// Errors that prevent a child from being started.
///
/// Once a child exists every result is reported as an
/// [`ExecutionOutcome`](crate::ExecutionOutcome) instead.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The requested limits were rejected before spawning.
    #[error("Invalid limits: {0}")]
    Limits(#[from] LimitsError),

    /// The result channel could not be created.
    #[error("Failed to create result channel: {0}")]
    Channel(#[source] io::Error),

    /// The child process could not be forked.
    #[error("Failed to spawn child process: {0}")]
    Spawn(#[source] io::Error),

    /// The blocking task running the supervisor was cancelled or panicked.
    #[error("Supervisor task failed: {0}")]
    Join(String),

    /// Process supervision is not available on this platform.
    #[error("Resource-bounded execution is not supported on this platform")]
    UnsupportedPlatform,
}

impl ExecError {
    /// Check if retrying the same call could succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Channel(_) | Self::Spawn(_))
    }
}
