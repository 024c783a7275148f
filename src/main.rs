use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use fsindex::cli::{self, Cli};
use fsindex::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let log = logging::init(&cli.log_options()).context("cannot open log file")?;

    info!("Starting fsindex-agent v{}", env!("CARGO_PKG_VERSION"));

    cli::run(cli, log).await
}
