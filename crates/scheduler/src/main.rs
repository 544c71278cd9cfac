mod cli;
mod shutdown;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use jobmill_engine::{start_engine, EngineConfig};

use crate::cli::Cli;
use crate::shutdown::{spawn_signal_handler, ShutdownController};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if !cli.db_file.exists() {
        anyhow::bail!("database file not found: {}", cli.db_file.display());
    }
    if cli.command.split_whitespace().next().is_none() {
        anyhow::bail!("command must not be empty");
    }
    if !(cli.speed_factor > 0.0) {
        anyhow::bail!("--speed-factor must be positive");
    }

    let engine = start_engine(EngineConfig {
        db_file: cli.db_file,
        command: cli.command,
        max_runtime: cli.max_runtime,
        margin_time: cli.margin_time,
        speed_factor: cli.speed_factor,
        smart_scheduling: cli.smart_scheduling,
        named_args: cli.named_args,
        parallel: cli.parallel as usize,
    });

    let shutdown = Arc::new(ShutdownController::new());
    spawn_signal_handler(shutdown, engine.stopper());

    engine.wait().await?;
    Ok(())
}
