//! runbound command-line interface.

pub mod commands;

use clap::{Parser, Subcommand};

/// runbound - run a command under memory, CPU, wall-clock and process limits
#[derive(Parser)]
#[command(name = "runbound")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a program inside a resource-bounded child
    Run(commands::run::RunArgs),

    /// Print the effective limits as JSON
    Limits(commands::limits::LimitsArgs),

    /// Show version information
    Version,
}

/// Run the CLI with the given arguments, returning the process exit code.
pub async fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Run(args) => commands::run::run(args).await,
        Commands::Limits(args) => commands::limits::run(args),
        Commands::Version => {
            println!("runbound {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
    }
}
