//! CLI command definitions and dispatch.

mod pull;

use clap::{Parser, Subcommand};

/// Pull container images into a local docker-distribution storage tree.
#[derive(Parser)]
#[command(name = "regmirror", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Pull images into a local registry data directory
    Pull {
        #[command(subcommand)]
        source: pull::PullSource,
    },
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Pull { source } => pull::execute(source).await,
    }
}
