//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

use crate::error::Result;
use crate::telemetry::LoggingConfig;

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WardenConfig {
    /// Decision engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// PostgreSQL policy store (absent = in-memory store)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Deadline for loading a request's policy snapshot. Past it the
    /// request fails closed.
    #[serde(default = "default_decision_timeout_ms")]
    pub decision_timeout_ms: u64,

    /// Memoize per-resource-type resolution inside a request
    #[serde(default = "default_memoize")]
    pub memoize: bool,
}

impl EngineConfig {
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            decision_timeout_ms: default_decision_timeout_ms(),
            memoize: default_memoize(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Pool acquire timeout
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

// Default value functions
fn default_decision_timeout_ms() -> u64 { 250 }
fn default_memoize() -> bool { true }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_acquire_timeout_ms() -> u64 { 5000 }

impl WardenConfig {
    /// Load configuration from `WARDEN__*` environment variables.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("WARDEN").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load from a file, with environment variables taking precedence.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("WARDEN").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
