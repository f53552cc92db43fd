//! dbsync: one-way PostgreSQL synchronization over SSH

mod cli;
mod commands;
mod output;
mod progress;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use dbsync_core::SyncConfig;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let result = run(cli).await;
    if let Err(error) = result {
        tracing::error!(error = %error, "command failed");
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = SyncConfig::load(&cli.config)?;
    match cli.command {
        Command::Pull(args) => commands::pull(config, args).await,
        Command::Clone(args) => commands::clone_database(config, args).await,
        Command::Restore(args) => commands::restore(config, args).await,
    }
}
