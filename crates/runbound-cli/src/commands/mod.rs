//! CLI command implementations.

pub mod limits;
pub mod run;

use clap::Args;
use runbound::ResourceLimits;
use std::path::PathBuf;

/// Limit flags shared by every command. Flags override the limits file.
#[derive(Args, Debug, Default)]
pub struct LimitArgs {
    /// JSON5 file with limits
    #[arg(long = "limits", env = "RUNBOUND_LIMITS", value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Address space ceiling in bytes
    #[arg(long, env = "RUNBOUND_MEMORY_BYTES", value_name = "BYTES")]
    pub memory: Option<u64>,

    /// CPU time ceiling in seconds
    #[arg(long, env = "RUNBOUND_CPU_SECONDS", value_name = "SECS")]
    pub cpu: Option<u64>,

    /// Wall clock ceiling in seconds
    #[arg(long, env = "RUNBOUND_WALL_SECONDS", value_name = "SECS")]
    pub wall: Option<u64>,

    /// Process/thread ceiling
    #[arg(long, env = "RUNBOUND_MAX_PROCESSES", value_name = "N")]
    pub procs: Option<u64>,

    /// Seconds between SIGTERM and SIGKILL on timeout
    #[arg(long, env = "RUNBOUND_GRACE_SECONDS", value_name = "SECS")]
    pub grace: Option<u64>,
}

impl LimitArgs {
    /// Combine the limits file (if any) with the flags.
    pub fn resolve(&self) -> anyhow::Result<ResourceLimits> {
        let base = match &self.file {
            Some(path) => ResourceLimits::load(path)?,
            None => ResourceLimits::default(),
        };

        let overlay = ResourceLimits {
            memory_bytes: self.memory,
            cpu_seconds: self.cpu,
            wall_seconds: self.wall,
            max_processes: self.procs,
            grace_seconds: 0,
        };
        let mut limits = base.merge(&overlay);
        if let Some(grace) = self.grace {
            limits.grace_seconds = grace;
        }

        limits.validate()?;
        Ok(limits)
    }
}
