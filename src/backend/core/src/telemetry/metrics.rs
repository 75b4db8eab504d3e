//! Decision metrics.
//!
//! Recorded through the `metrics` facade; the embedding service installs
//! whichever recorder/exporter it uses.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Duration;

use crate::authz::Decision;

/// Which facade question produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionKind {
    /// Coarse `can(key)`
    Capability,
    /// Fine-grained resource flag
    ResourceFlag,
    /// Listing scope
    Scope,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capability => "capability",
            Self::ResourceFlag => "resource_flag",
            Self::Scope => "scope",
        }
    }
}

/// Register metric descriptions. Call once after installing a recorder.
pub fn describe_metrics() {
    describe_counter!("warden_decisions_total", "Authorization decisions by kind and outcome");
    describe_counter!(
        "warden_fail_closed_total",
        "Requests denied because their policy snapshot could not be loaded"
    );
    describe_counter!("warden_errors_total", "Errors by code and category");
    describe_histogram!(
        "warden_snapshot_load_seconds",
        "Time to load a request's policy snapshot"
    );
}

/// Helpers for recording decision metrics.
pub struct DecisionMetrics;

impl DecisionMetrics {
    pub fn record(kind: DecisionKind, decision: &Decision) {
        let outcome = if decision.is_allowed() { "allow" } else { "deny" };
        counter!(
            "warden_decisions_total",
            "kind" => kind.as_str(),
            "outcome" => outcome,
        )
        .increment(1);
    }

    pub fn record_scope(scope: &str) {
        counter!(
            "warden_decisions_total",
            "kind" => DecisionKind::Scope.as_str(),
            "outcome" => scope.to_string(),
        )
        .increment(1);
    }

    pub fn record_fail_closed(reason: &'static str) {
        counter!("warden_fail_closed_total", "reason" => reason).increment(1);
    }

    pub fn record_snapshot_load(elapsed: Duration) {
        histogram!("warden_snapshot_load_seconds").record(elapsed.as_secs_f64());
    }
}
