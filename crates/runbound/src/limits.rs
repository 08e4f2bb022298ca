//! Resource ceilings for a bounded call.

use crate::error::LimitsError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Resource ceilings applied to the child running a unit of work.
///
/// Every ceiling is optional; an unset field leaves the inherited OS limit in
/// place. The record is cloned into the child and never mutated once a call
/// has started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceLimits {
    /// Maximum address space in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,

    /// Maximum CPU time in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_seconds: Option<u64>,

    /// Maximum wall clock time in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_seconds: Option<u64>,

    /// Maximum number of processes/threads for the child's user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_processes: Option<u64>,

    /// Time the process group is given to exit after a termination request.
    #[serde(default)]
    pub grace_seconds: u64,
}

impl ResourceLimits {
    /// Create limits with no ceilings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Alias for [`ResourceLimits::new`] that reads better at call sites.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Builder-style method to set the memory limit in bytes.
    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory_bytes = Some(bytes);
        self
    }

    /// Builder-style method to set the memory limit in megabytes.
    pub fn with_memory_mb(self, megabytes: u64) -> Self {
        self.with_memory(megabytes.saturating_mul(BYTES_PER_MB))
    }

    /// Builder-style method to set the CPU time limit.
    pub fn with_cpu_time(mut self, secs: u64) -> Self {
        self.cpu_seconds = Some(secs);
        self
    }

    /// Builder-style method to set the wall time limit.
    pub fn with_wall_time(mut self, secs: u64) -> Self {
        self.wall_seconds = Some(secs);
        self
    }

    /// Builder-style method to set the process/thread limit.
    pub fn with_max_processes(mut self, count: u64) -> Self {
        self.max_processes = Some(count);
        self
    }

    /// Builder-style method to set the termination grace period.
    pub fn with_grace_period(mut self, secs: u64) -> Self {
        self.grace_seconds = secs;
        self
    }

    /// Whether no ceiling at all is configured.
    pub fn is_unlimited(&self) -> bool {
        self.memory_bytes.is_none()
            && self.cpu_seconds.is_none()
            && self.wall_seconds.is_none()
            && self.max_processes.is_none()
    }

    /// Wall clock deadline as a [`Duration`], if one is set.
    pub fn wall_timeout(&self) -> Option<Duration> {
        self.wall_seconds.map(Duration::from_secs)
    }

    /// Grace period as a [`Duration`].
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_seconds)
    }

    /// Overlay every ceiling set in `other` onto `self`.
    pub fn merge(mut self, other: &ResourceLimits) -> Self {
        if other.memory_bytes.is_some() {
            self.memory_bytes = other.memory_bytes;
        }
        if other.cpu_seconds.is_some() {
            self.cpu_seconds = other.cpu_seconds;
        }
        if other.wall_seconds.is_some() {
            self.wall_seconds = other.wall_seconds;
        }
        if other.max_processes.is_some() {
            self.max_processes = other.max_processes;
        }
        if other.grace_seconds != 0 {
            self.grace_seconds = other.grace_seconds;
        }
        self
    }

    /// Validate the limits, collecting all errors before returning.
    pub fn validate(&self) -> Result<(), LimitsError> {
        let mut errors = Vec::new();

        if self.memory_bytes == Some(0) {
            errors.push("memory_bytes must be greater than 0".to_string());
        }
        if self.cpu_seconds == Some(0) {
            errors.push("cpu_seconds must be greater than 0".to_string());
        }
        // alarm(0) cancels instead of arming, so zero has no meaning here
        if self.wall_seconds == Some(0) {
            errors.push("wall_seconds must be greater than 0".to_string());
        }
        if self.max_processes == Some(0) {
            errors.push("max_processes must be greater than 0".to_string());
        }
        if let Some(wall) = self.wall_seconds {
            if wall > u64::from(u32::MAX) {
                errors.push(format!("wall_seconds {} exceeds the alarm range", wall));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(LimitsError::Validation(errors))
        }
    }

    /// Log every configured ceiling at debug level.
    pub fn announce(&self) {
        if let Some(bytes) = self.memory_bytes {
            debug!("restricting call to {} bytes of memory", bytes);
        }
        if let Some(secs) = self.cpu_seconds {
            debug!("restricting call to {} seconds of CPU time", secs);
        }
        if let Some(secs) = self.wall_seconds {
            debug!("restricting call to {} seconds of wall time", secs);
        }
        if let Some(count) = self.max_processes {
            debug!("restricting call to {} processes/threads", count);
        }
    }

    /// Load limits from a JSON5 file.
    pub fn load(path: &Path) -> Result<Self, LimitsError> {
        if !path.exists() {
            return Err(LimitsError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse limits from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, LimitsError> {
        json5::from_str(content).map_err(|e| LimitsError::Json5(e.to_string()))
    }

    /// Serialize to a pretty JSON string.
    pub fn to_json(&self) -> Result<String, LimitsError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
