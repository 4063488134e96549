//! storysync CLI: incremental catalog crawler and snapshot publisher.
//!
//! Discovers entries on a listing source, fetches new units for each,
//! merges them into `stories.json` and publishes it to the configured sink.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
