//! Structured logging.
//!
//! Decision events are emitted under the `warden_core::authz` target: allow
//! and deny details at `debug`, fail-closed loads at `warn`. Setting
//! `decision_audit` raises that target to `debug` regardless of the global
//! level, which is how operators trace a single denial in production.

use serde::Deserialize;
use std::collections::BTreeMap;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Target under which authorization decisions are logged.
pub const DECISION_TARGET: &str = "warden_core::authz";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base filter, e.g. `info` or `warn,sqlx=error`. Falls back to `RUST_LOG`.
    pub level: String,
    pub format: LogFormat,
    /// Extra `target=level` directives, applied after `level`.
    pub targets: BTreeMap<String, String>,
    /// Log every allow/deny decision.
    pub decision_audit: bool,
    /// Include file and line of the call site.
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            format: LogFormat::default(),
            targets: BTreeMap::new(),
            decision_audit: false,
            include_location: false,
        }
    }
}

impl LoggingConfig {
    /// Assemble the `EnvFilter` from the base level and target directives.
    pub fn env_filter(&self) -> anyhow::Result<EnvFilter> {
        let mut filter = EnvFilter::try_new(&self.level)?;
        for (target, level) in &self.targets {
            filter = filter.add_directive(format!("{}={}", target, level).parse()?);
        }
        if self.decision_audit {
            filter = filter.add_directive(format!("{}=debug", DECISION_TARGET).parse()?);
        }
        Ok(filter)
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let base = fmt::layer()
            .with_file(self.include_location)
            .with_line_number(self.include_location);
        match self.format {
            LogFormat::Json => base.json().boxed(),
            LogFormat::Pretty => base.pretty().boxed(),
            LogFormat::Compact => base.compact().boxed(),
        }
    }
}

/// Output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event
    #[default]
    Json,
    /// Multi-line, for local development
    Pretty,
    Compact,
}

/// Install the global subscriber.
///
/// # Errors
///
/// Fails on an invalid filter directive or when a subscriber is already
/// installed.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = config.env_filter()?;
    tracing_subscriber::registry()
        .with(config.fmt_layer())
        .with(filter)
        .try_init()?;
    Ok(())
}
