mod cli;
mod compose;
mod config;
mod deploy;
mod error;
mod exec;
mod instance;
mod output;
mod ports;
mod ssh;
mod sync;
mod upstream;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use exec::Executor;
use ssh::SshTransport;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .without_time()
        .init();

    let config = config::SwitchyardConfig::load(&cli.config)?;
    let transport = Arc::new(SshTransport::new(&config));
    let mut exec = Executor::new(transport.clone())
        .with_command_timeout(Duration::from_secs(config.ssh.command_timeout));

    let result = match cli.command {
        Command::Deploy { environment, image } => {
            cli::deploy::run(&config, &exec, &environment, image).await
        }

        Command::Sync {
            environment,
            all: _,
            force,
        } => cli::sync::run(&config, &mut exec, environment.as_deref(), force).await,

        Command::Status {
            environment,
            all: _,
        } => cli::status::run(&config, &mut exec, environment.as_deref()).await,
    };

    for task in exec.live_tasks() {
        warn!("Abandoning unfinished task {}", task);
        exec.cancel(&task);
    }
    if let Err(e) = transport.close().await {
        debug!("Closing SSH sessions: {:#}", e);
    }
    result
}
