use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::Context as _;
use clap::Parser;
use kiln_core::Config;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod commands;

fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    let mut config = Config::resolve(cli.config.as_deref()).context("cannot load configuration")?;
    if let Some(workers) = cli.workers {
        config.multiprocessing.workers = workers;
        config.multiprocessing.enabled = workers > 1;
    }
    let config_path = cli.config.clone().unwrap_or_else(|| config.config_path());

    init_logging(&config, cli.verbose)?;
    commands::run_command(cli, config, config_path)
}

/// `RUST_LOG` wins, then `-vv`, then `logging.level`.
fn init_logging(config: &Config, verbose: u8) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose > 1 { "debug" } else { config.logging.level.as_str() };
        EnvFilter::new(level)
    });

    match config.log_file() {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}
