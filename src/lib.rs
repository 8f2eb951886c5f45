//! # Alert Control Plane
//!
//! An automated alert-response control plane for a fleet of microservices.
//!
//! The system ingests externally generated alerts, coordinates their lifecycle
//! from `Pending` through `InProcessing` to `Restored`, executes healing
//! actions for severe (P0) alerts, verifies healing through a timed
//! observation window, and adaptively tightens anomaly-detection thresholds
//! using historical time-series behavior.
//!
//! ## Architecture
//!
//! Four tightly coupled subsystems run concurrently against a shared
//! durable [`store`] (Postgres) and a shared hot-state [`cache`] (Redis):
//!
//! - [`scheduler::pending`] drains `Pending` alerts, publishes them on the
//!   internal [`bus`], and atomically advances alert/service-health state.
//! - [`remediation`] consumes published alerts, drives [`heal`] actions and
//!   [`observation`] windows, and closes alerts idempotently.
//! - [`scheduler::anomaly`] synthesizes Prometheus queries from the
//!   [`ruleset`] registry, runs per-series anomaly detection, and tightens
//!   thresholds through the [`materializer`].
//! - [`ruleset`] mediates changes to alert rules and thresholds, keeping the
//!   in-memory [`materializer`] consistent with the durable store.

pub mod bootstrap;
pub mod bus;
pub mod cache;
pub mod config;
pub mod external;
pub mod heal;
pub mod logging;
pub mod materializer;
pub mod model;
pub mod monitoring;
pub mod observation;
pub mod remediation;
pub mod ruleset;
pub mod scheduler;
pub mod store;

pub mod app;

use thiserror::Error;

/// Comprehensive error type covering every core subsystem.
///
/// Each variant corresponds to one of the error kinds from the design's
/// error-handling section: a point read that found nothing, a compare-and-set
/// that lost a race, a validation failure, a transport failure to an
/// adjacent system, or a cancelled operation.
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    /// A point read (single row/record) found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A compare-and-set observed a state other than the one expected.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A request failed validation before any I/O was attempted.
    #[error("invalid: {0}")]
    Invalid(String),

    /// A dependency (store, cache, or an HTTP collaborator) could not be
    /// reached or returned a transport-level failure.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The operation was cancelled via its governing cancellation token.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl From<sqlx::Error> for ControlPlaneError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ControlPlaneError::NotFound(err.to_string()),
            other => ControlPlaneError::Unavailable(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for ControlPlaneError {
    fn from(err: redis::RedisError) -> Self {
        ControlPlaneError::Unavailable(err.to_string())
    }
}

impl From<reqwest::Error> for ControlPlaneError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ControlPlaneError::Unavailable(format!("timeout: {err}"))
        } else {
            ControlPlaneError::Unavailable(err.to_string())
        }
    }
}

/// Result type used across the control plane.
pub type Result<T> = std::result::Result<T, ControlPlaneError>;
