//! Run a program inside a resource-bounded child.

use super::LimitArgs;
use clap::Args;
use nix::sys::resource::{getrusage, UsageWho};
use nix::sys::signal::Signal;
use nix::sys::time::TimeVal;
use runbound::{execute_async, AbortReason, ExecutionOutcome, ResourceLimits};
use serde::{Deserialize, Serialize};
use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info};

/// Exit codes reported when the program did not finish on its own.
pub mod exit_codes {
    /// The wall clock ceiling was reached.
    pub const TIMED_OUT: i32 = 124;
    /// A ceiling aborted the call.
    pub const ABORTED: i32 = 125;
    /// The bounded child crashed.
    pub const CRASHED: i32 = 126;
}

/// Run command arguments.
#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub limits: LimitArgs,

    /// Print the outcome as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// Program and arguments to run
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// How the bounded program exited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Ceiling the program's death is attributed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breached: Option<AbortReason>,
}

impl ProgramExit {
    /// Shell-style exit code: the code itself, or 128 + signal.
    pub fn shell_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => exit_codes::CRASHED,
        }
    }
}

/// Attribute a signal death of the program to the ceiling that caused it.
///
/// The program inherits the rlimits but not the abort handlers, so it dies
/// from the kernel's default actions instead of reporting an abort.
pub fn limit_breach(
    signal: Option<i32>,
    cpu_time: Duration,
    limits: &ResourceLimits,
) -> Option<AbortReason> {
    let signal = Signal::try_from(signal?).ok()?;
    match signal {
        Signal::SIGXCPU => Some(AbortReason::CpuTime),
        // the hard CPU limit was reached before SIGXCPU took effect
        Signal::SIGKILL => limits
            .cpu_seconds
            .filter(|secs| cpu_time >= Duration::from_secs(*secs))
            .map(|_| AbortReason::CpuTime),
        // allocation failures abort, as in the bounded child itself
        Signal::SIGABRT if limits.memory_bytes.is_some() => Some(AbortReason::MemoryLimit),
        _ => None,
    }
}

fn duration_of(time: TimeVal) -> Duration {
    Duration::from_secs(time.tv_sec().max(0) as u64)
        + Duration::from_micros(time.tv_usec().max(0) as u64)
}

/// CPU time used by reaped children of this process.
fn children_cpu_time() -> Duration {
    match getrusage(UsageWho::RUSAGE_CHILDREN) {
        Ok(usage) => duration_of(usage.user_time()) + duration_of(usage.system_time()),
        Err(_) => Duration::ZERO,
    }
}

fn run_program(
    (program, args, limits): (String, Vec<String>, ResourceLimits),
) -> std::io::Result<ProgramExit> {
    let status = Command::new(&program).args(&args).status()?;
    Ok(ProgramExit {
        code: status.code(),
        signal: status.signal(),
        breached: limit_breach(status.signal(), children_cpu_time(), &limits),
    })
}

/// Report a program killed by a ceiling as an abort.
pub fn attribute_breach(outcome: ExecutionOutcome<ProgramExit>) -> ExecutionOutcome<ProgramExit> {
    match outcome {
        ExecutionOutcome::Success(ProgramExit {
            breached: Some(reason),
            ..
        }) => ExecutionOutcome::Aborted(reason),
        other => other,
    }
}

/// Map an outcome to the CLI's exit code.
pub fn exit_code(outcome: &ExecutionOutcome<ProgramExit>) -> i32 {
    match outcome {
        ExecutionOutcome::Success(ProgramExit {
            breached: Some(_), ..
        }) => exit_codes::ABORTED,
        ExecutionOutcome::Success(exit) => exit.shell_code(),
        ExecutionOutcome::Aborted(_) => exit_codes::ABORTED,
        ExecutionOutcome::CrashedExitCode(_) => exit_codes::CRASHED,
        ExecutionOutcome::TimedOut => exit_codes::TIMED_OUT,
    }
}

/// Run the run command.
pub async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let limits = args.limits.resolve()?;
    let mut command = args.command.into_iter();
    let program = command
        .next()
        .ok_or_else(|| anyhow::anyhow!("no program given"))?;
    let program_args: Vec<String> = command.collect();

    debug!("Running {} {:?} under {:?}", program, program_args, limits);
    let work = (program.clone(), program_args, limits.clone());
    let outcome = attribute_breach(execute_async(run_program, work, limits).await?);

    if args.json {
        println!("{}", serde_json::to_string(&outcome)?);
    } else if !outcome.is_success() {
        eprintln!("runbound: {}: {}", program, outcome);
    }
    info!("{} finished: {}", program, outcome);

    Ok(exit_code(&outcome))
}
