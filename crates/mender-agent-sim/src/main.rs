mod capabilities;
mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let device_id = std::env::var("MENDER_DEVICE_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

    match cli.command {
        Command::RunOnce => commands::run_once(&cli.config, cli.ephemeral, &cli.store_path, &device_id).await,
        Command::Serve => commands::serve(&cli.config, cli.ephemeral, &cli.store_path, &device_id).await,
        Command::Status => commands::status(&cli.config, cli.ephemeral, &cli.store_path, &device_id).await,
    }
}
