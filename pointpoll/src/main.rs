//! Per-point Modbus poller.
//!
//! Loads a JSON5 list of points and polls each one on its own schedule
//! until Ctrl+C or until every point has terminated.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use pointpoll::PollerConfig;
use pointpoll::PollerRunner;
use pointpoll::args::PollerArgs;

#[tokio::main]
async fn main() -> Result<()> {
    let args = PollerArgs::parse();
    let config_path = args.config_path();

    // Load configuration
    let config = PollerConfig::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Initialize logging
    let log_config = args.logging(&config.logging);
    pointpoll_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting pointpoll");
    info!("Loaded configuration from {:?}", config_path);

    let runner = PollerRunner::start(&config.parameters).with_grace(args.shutdown_grace());
    runner.run().await;

    Ok(())
}
