//! runbound CLI entry point.

use clap::Parser;
use runbound_cli::{run, Cli};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = match cli.verbose {
        0 => "runbound=info,runbound_cli=info",
        1 => "runbound=debug,runbound_cli=debug",
        _ => "runbound=trace,runbound_cli=trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Run the command
    let code = run(cli).await?;
    std::process::exit(code)
}
