//! Telemetry: structured logging and decision metrics.
//!
//! - **Logging**: JSON/pretty/compact `tracing` output with per-module levels
//! - **Metrics**: counters for decisions, fail-closed loads, and snapshot
//!   load latency, recorded through the `metrics` facade
//!
//! # Example
//!
//! ```rust,no_run
//! use warden_core::telemetry::{init_logging, LoggingConfig};
//!
//! init_logging(&LoggingConfig::default()).expect("Failed to initialize logging");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{describe_metrics, DecisionKind, DecisionMetrics};
