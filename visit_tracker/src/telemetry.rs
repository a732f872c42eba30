//! Logging initialization.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

use crate::settings::LoggingConfig;

/// Initialize logging based on configuration. `RUST_LOG` wins over the
/// configured level.
pub fn init(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))?;

    if logging.format == "json" {
        init_json(filter, logging.enable_target)
    } else {
        init_text(filter, logging.enable_target)
    }
}

fn init_json(filter: EnvFilter, with_target: bool) -> Result<()> {
    let subscriber = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().with_target(with_target));

    tracing::subscriber::set_global_default(subscriber)?;
    tracing::info!("JSON logging initialized");
    Ok(())
}

fn init_text(filter: EnvFilter, with_target: bool) -> Result<()> {
    let subscriber = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(with_target));

    tracing::subscriber::set_global_default(subscriber)?;
    tracing::info!("Console logging initialized");
    Ok(())
}
