//! Lorepath CLI: run the learning-content pipeline and administer its jobs.
//!
//! Watches folders and URLs for new material, turns it into content units,
//! and builds the adaptive narrative graph that learner sessions traverse.

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
