mod cli;
mod cli_utils;
mod commands;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging
    seamless::logging::init();

    let cli = Cli::parse();
    let common = &cli.common;

    match &cli.command {
        Commands::Checksum(args) => commands::checksum::run(args),
        Commands::Run(args) => commands::run::run(common, args).await,
        Commands::Fingertip(target) => commands::cache::fingertip(common, target).await,
        Commands::Status(target) => commands::cache::status(common, target).await,
        Commands::Undo(target) => commands::cache::undo(common, target).await,
        Commands::ClearException(target) => commands::cache::clear_exception(common, target).await,
    }
}
