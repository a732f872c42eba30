//! Configuration management with environment variable support and validation.

use anyhow::{anyhow, Result};
use chrono::Duration;
use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use crate::resolver::ResolverConfig;
use crate::schema::VisitSchema;
use crate::tracker::TrackerConfig;

/// Longest accepted visit timeout (one week).
pub const MAX_VISIT_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Visit resolution and persistence behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSettings {
    pub visit_timeout_seconds: u64,
    pub split_visits_at_midnight: bool,
    pub custom_dimensions: usize,
    pub max_attempts: u32,
    pub store_timeout_ms: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            visit_timeout_seconds: 1_800,
            split_visits_at_midnight: false,
            custom_dimensions: 5,
            max_attempts: 3,
            store_timeout_ms: 2_000,
        }
    }
}

/// Which visit store backs the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Sled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub path: PathBuf,
    pub flush_on_write: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sled,
            path: PathBuf::from("data/visits"),
            flush_on_write: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySettings {
    pub max_concurrent_hits: usize,
    pub output_file: Option<PathBuf>,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            max_concurrent_hits: 8,
            output_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
    pub enable_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            enable_target: false,
        }
    }
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub tracker: TrackerSettings,
    pub store: StoreSettings,
    pub replay: ReplaySettings,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load settings from configuration files and environment variables
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            // Start with default settings
            .add_source(config::File::from_str(
                include_str!("../config.toml"),
                config::FileFormat::Toml,
            ))
            // Add local config file if it exists
            .add_source(config::File::with_name("visit_tracker").required(false))
            // Add environment variables with VT__ prefix
            .add_source(
                Environment::with_prefix("VT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;

        Self::apply_env_overrides(&mut settings);

        settings.validate()?;

        Ok(settings)
    }

    /// Shorthand variables kept for deployment scripts
    fn apply_env_overrides(settings: &mut Settings) {
        if let Ok(path) = std::env::var("VT_STORE_PATH") {
            settings.store.path = PathBuf::from(path);
        }
        if let Ok(level) = std::env::var("VT_LOG_LEVEL") {
            settings.logging.level = level;
        }
    }

    /// Validate settings for consistency
    pub fn validate(&self) -> Result<()> {
        if self.tracker.visit_timeout_seconds == 0 {
            return Err(anyhow!("Visit timeout cannot be 0"));
        }
        if self.tracker.visit_timeout_seconds > MAX_VISIT_TIMEOUT_SECS {
            return Err(anyhow!(
                "Visit timeout of {}s exceeds the maximum of {}s",
                self.tracker.visit_timeout_seconds,
                MAX_VISIT_TIMEOUT_SECS
            ));
        }
        if self.tracker.max_attempts == 0 {
            return Err(anyhow!("Max attempts must be at least 1"));
        }
        if self.tracker.store_timeout_ms == 0 {
            return Err(anyhow!("Store timeout cannot be 0"));
        }
        if self.replay.max_concurrent_hits == 0 {
            return Err(anyhow!("Replay concurrency cannot be 0"));
        }
        if !matches!(self.logging.format.as_str(), "json" | "text") {
            return Err(anyhow!("Unknown log format: {}", self.logging.format));
        }
        if self.store.backend == StoreBackend::Memory && self.store.flush_on_write {
            warn!("flush_on_write has no effect on the memory store");
        }
        Ok(())
    }

    pub fn schema(&self) -> Arc<VisitSchema> {
        Arc::new(VisitSchema::new(self.tracker.custom_dimensions))
    }

    pub fn resolver_config(&self) -> Result<ResolverConfig> {
        let visit_timeout = i64::try_from(self.tracker.visit_timeout_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| anyhow!("Visit timeout out of range: {}s", self.tracker.visit_timeout_seconds))?;

        Ok(ResolverConfig {
            visit_timeout,
            split_visits_at_midnight: self.tracker.split_visits_at_midnight,
        })
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            max_attempts: self.tracker.max_attempts,
            store_timeout: std::time::Duration::from_millis(self.tracker.store_timeout_ms),
        }
    }
}
