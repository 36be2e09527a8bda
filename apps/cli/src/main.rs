//! genpipe CLI: route intents, inspect sources, and run generation sessions.
//!
//! Drives the orchestration core from the command line and gives offline
//! access to the discovery-session log.

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
