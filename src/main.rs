//! `aa-engine` - executes autonomous agent triggers
//!
//! Loads a ledger snapshot into in-memory stores and drains the queued AA
//! triggers, printing every response the cascade produced.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, ConfigCommand};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Drain {
            snapshot,
            evaluator,
            json,
        } => {
            let config = cli::config::load(config_path)?;
            cli::engine::handle_drain(config, &snapshot, evaluator, json).await?;
        }
        Commands::Run {
            snapshot,
            evaluator,
        } => {
            let config = cli::config::load(config_path)?;
            cli::engine::handle_run(config, &snapshot, evaluator).await?;
        }
        Commands::Config { cmd } => match cmd {
            ConfigCommand::Show => {
                let config = cli::config::load(config_path)?;
                cli::config::handle_show(&config)?;
            }
            ConfigCommand::Check => cli::config::handle_check(config_path)?,
        },
    }
    Ok(())
}
