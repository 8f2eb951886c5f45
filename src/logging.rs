//! Structured logging helpers.
//!
//! Thin wrappers over `tracing` that attach a `category` field so log
//! aggregation can filter by subsystem without every call site repeating
//! `target = "..."`. Schedulers and the remediation consumer log and continue
//! on per-item errors (see the error-handling design); these helpers are the
//! single place that policy is expressed.

use serde_json::Value;
use tracing::{error, info, warn};

/// Coarse subsystem a log line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    PendingScheduler,
    Remediation,
    Observation,
    Heal,
    AnomalyScheduler,
    Ruleset,
    Store,
    Cache,
    System,
}

impl LogCategory {
    fn as_str(&self) -> &'static str {
        match self {
            LogCategory::PendingScheduler => "pending_scheduler",
            LogCategory::Remediation => "remediation",
            LogCategory::Observation => "observation",
            LogCategory::Heal => "heal",
            LogCategory::AnomalyScheduler => "anomaly_scheduler",
            LogCategory::Ruleset => "ruleset",
            LogCategory::Store => "store",
            LogCategory::Cache => "cache",
            LogCategory::System => "system",
        }
    }
}

/// Log an informational event for `category`.
pub fn log_info(category: LogCategory, message: &str) {
    info!(category = category.as_str(), "{}", message);
}

/// Log a recoverable-error event for `category`. Used by the schedulers and
/// the remediation consumer when swallowing a per-item failure to continue
/// the loop, per the error-handling design's propagation policy.
pub fn log_warn(category: LogCategory, message: &str) {
    warn!(category = category.as_str(), "{}", message);
}

/// Log a hard-error event for `category`, including the error's cause chain.
pub fn log_error(category: LogCategory, message: &str, err: &dyn std::error::Error) {
    error!(category = category.as_str(), error = %err, "{}", message);
}

/// Log a timed operation with structured JSON context, e.g. tick durations
/// or per-series detection latency.
pub fn log_performance(operation: &str, duration_ms: u64, context: Value) {
    info!(
        category = LogCategory::System.as_str(),
        operation,
        duration_ms,
        context = %context,
        "performance"
    );
}
