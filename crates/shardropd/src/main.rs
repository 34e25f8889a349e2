//! shardropd: shardrop expiry daemon
//!
//! Usage:
//!   shardropd [--config /etc/shardrop/config.toml] [--log info] [--log-format json|text]
//!
//! Sweeps expired uploads on `daemon.sweep_interval_secs` and serves
//! /metrics, /healthz and /readyz on `daemon.metrics_addr`.

mod daemon;
mod metrics;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use shardrop_core::config::ShardropConfig;
use std::path::Path;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "shardropd", version, about = "shardrop expiry daemon")]
struct Cli {
    /// Path to shardrop.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "SHARDROP_CONFIG",
        default_value = "/etc/shardrop/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to daemon.log_level
    #[arg(long, env = "SHARDROP_LOG")]
    log: Option<String>,

    /// Log format; defaults to daemon.log_format
    #[arg(long, env = "SHARDROP_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, missing) = load_config(&cli.config).await?;

    let level = cli.log.as_deref().unwrap_or(&config.daemon.log_level);
    let format = cli.log_format.clone().unwrap_or_else(|| {
        if config.daemon.log_format == "json" {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    });
    init_logging(level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "shardropd starting"
    );
    if missing {
        tracing::warn!("config file not found: {}  (using defaults)", cli.config.display());
    }
    config.validate()?;

    daemon::run(config).await
}

/// Returns the config and whether the file was missing.
async fn load_config(path: &Path) -> Result<(ShardropConfig, bool)> {
    if !path.exists() {
        return Ok((ShardropConfig::default(), true));
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
    let config = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
    Ok((config, false))
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
