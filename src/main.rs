//! timekeepd — user-space time-synchronisation daemon.
//!
//! Disciplines the host clock against remote time sources and local
//! reference clocks (see `timekeep_core`); this binary is the thin process
//! harness around it — CLI parsing, config loading, signal handling, and
//! systemd integration — none of which is part of the seven core modules.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod run;
mod service;
mod signal;

use cli::{Cli, Commands, ServiceAction};
use config::DaemonConfig;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, foreground } => {
            let cfg = DaemonConfig::load(&config)
                .with_context(|| format!("loading config from {}", config.display()))?;
            init_logging(&cfg.daemon.log_level)?;
            run::run(cfg, foreground)
        }
        Commands::Keygen { keyfile, id, bits } => {
            init_logging("info")?;
            anyhow::ensure!(
                bits == 128 || bits == 160,
                "key length must be 128 or 160 bits, got {bits}"
            );
            timekeep_core::keys::generate_key(&keyfile, id, (bits / 8) as usize)
                .with_context(|| format!("generating key {id} into {}", keyfile.display()))?;
            println!(
                "Appended key {id} ({bits}-bit) to {}.",
                keyfile.display()
            );
            Ok(())
        }
        Commands::Service { action } => {
            init_logging("info")?;
            match action {
                ServiceAction::Install { config } => service::install(&config),
                ServiceAction::Uninstall => service::uninstall(),
            }
        }
    }
}

fn init_logging(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}
