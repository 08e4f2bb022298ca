//! Show the effective limits.

use super::LimitArgs;
use clap::Args;

/// Limits command arguments.
#[derive(Args)]
pub struct LimitsArgs {
    #[command(flatten)]
    pub limits: LimitArgs,
}

/// Print the resolved limits as JSON.
pub fn run(args: LimitsArgs) -> anyhow::Result<i32> {
    let limits = args.limits.resolve()?;
    println!("{}", limits.to_json()?);
    Ok(0)
}
