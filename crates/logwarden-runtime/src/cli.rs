//! CLI definition using clap derive.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "logwarden", about = "log pattern monitor and escalation daemon")]
pub struct Cli {
    /// Path to the TOML config file
    #[arg(long, short = 'c', global = true, default_value = "logwarden.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the monitor daemon (tail loops + control channel)
    Daemon(DaemonOpts),
    /// Parse the config and list the instances that would be watched
    Check,
}

#[derive(clap::Args)]
pub struct DaemonOpts {
    /// Override the control channel port from the config
    #[arg(long)]
    pub control_port: Option<u16>,
}
