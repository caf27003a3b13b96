use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "mender-agent-sim",
    about = "Demo driver for the OTA update-agent core: authenticates, checks for a \
             deployment, and drives it to completion against a configured server",
    version
)]
pub struct Cli {
    /// Path to the client configuration YAML (device_type, server_url, poll intervals).
    #[arg(long, env = "MENDER_CONFIG", default_value = "mender.yaml")]
    pub config: PathBuf,

    /// Use an in-memory store instead of a redb file — state is lost on exit.
    #[arg(long)]
    pub ephemeral: bool,

    /// Path to the redb state file (ignored with --ephemeral).
    #[arg(long, default_value = "mender-agent-sim.redb")]
    pub store_path: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one authentication + update-check cycle and exit.
    RunOnce,

    /// Run the cooperative scheduler (§4.6) until interrupted, firing the
    /// authentication and update work units on their configured intervals.
    Serve,

    /// Print the currently stored artifact name and pending deployment, if any.
    Status,
}
