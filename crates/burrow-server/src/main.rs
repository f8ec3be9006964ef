//! burrow relay server binary

use anyhow::{Context, Result};
use burrow_server::ServerConfig;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {log_level}"))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::from_env().context("invalid server configuration")?;

    setup_logging(&config.log_level)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        port = config.api_port,
        "starting burrow server"
    );

    burrow_server::run(config).await
}
