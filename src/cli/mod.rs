use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;

pub mod deploy;
pub mod status;
pub mod sync;

#[derive(Parser)]
#[command(
    name = "switchyard",
    version,
    about = "Zero-downtime container cutovers behind an nginx proxy"
)]
pub struct Cli {
    /// Path to switchyard.toml
    #[arg(short, long, default_value = "switchyard.toml")]
    pub config: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start a new instance, health-check it, and move traffic to it
    Deploy {
        /// Target environment
        environment: String,
        /// Deploy this image instead of the configured one
        #[arg(long)]
        image: Option<String>,
    },

    /// Point upstream records back at the ports instances actually publish
    #[command(group(ArgGroup::new("target").required(true).args(["environment", "all"])))]
    Sync {
        /// Environment to reconcile
        environment: Option<String>,
        /// Reconcile every container environment
        #[arg(long)]
        all: bool,
        /// Rewrite and reload even when the record already matches
        #[arg(long)]
        force: bool,
    },

    /// Show declared and published ports without changing anything
    #[command(group(ArgGroup::new("target").required(true).args(["environment", "all"])))]
    Status {
        /// Environment to inspect
        environment: Option<String>,
        /// Inspect every container environment
        #[arg(long)]
        all: bool,
    },
}
