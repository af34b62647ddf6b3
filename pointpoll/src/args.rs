//! CLI argument parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use pointpoll_common::{LogFormat, LoggingConfig};

/// Default configuration file, looked up in the working directory.
pub const DEFAULT_CONFIG: &str = "pointpoll.json5";

/// Per-point Modbus poller (TCP/RTU).
#[derive(Parser, Debug, Clone)]
#[command(name = "pointpoll")]
#[command(about = "Polls Modbus registers and coils on a per-point schedule")]
#[command(version)]
pub struct PollerArgs {
    /// Path to configuration file (JSON5 format).
    #[arg(value_name = "CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Path to configuration file (same as the positional argument).
    #[arg(short, long, conflicts_with = "config_file")]
    pub config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (text, json).
    #[arg(long)]
    pub log_format: Option<LogFormat>,

    /// How long points get to close their connections on shutdown, in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = 2000)]
    pub shutdown_grace_ms: u64,
}

impl PollerArgs {
    /// Configuration path from `--config`, the positional argument, or the default.
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .or_else(|| self.config_file.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
    }

    /// Shutdown grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Apply CLI overrides on top of the file's logging section.
    pub fn logging(&self, base: &LoggingConfig) -> LoggingConfig {
        LoggingConfig {
            level: self.log_level.clone().unwrap_or_else(|| base.level.clone()),
            format: self.log_format.unwrap_or(base.format),
        }
    }
}
