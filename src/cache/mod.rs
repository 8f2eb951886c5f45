//! Hot-State Cache (C2): a low-latency mirror of alert and service-health
//! state, plus the secondary indexes and atomic compare-and-set (CAS)
//! scripts that arbitrate concurrent schedulers (§4.2).
//!
//! A CAS script, in one atomic execution: (a) reads the current record, (b)
//! verifies the expected prior state (`None` means "no expectation"), (c)
//! mutates the state, (d) moves the id between secondary indexes. Mirrors
//! the `1`/`-1`/`0` contract as [`CasOutcome::Applied`]/`Conflict`/`Missing`.
//! Callers MUST NOT blindly retry on `Conflict` — another actor already won.

pub mod memory;
pub mod redis_cache;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{AlertLevel, AlertState, AlertStatus, HealthState, Labels, ObservationWindow};
use crate::Result;

pub use memory::InMemoryCache;
pub use redis_cache::RedisCache;

/// Outcome of a CAS script invocation (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The expected prior state matched; the mutation and index move took effect.
    Applied,
    /// A prior state was expected but the record held something else.
    Conflict,
    /// No record existed for the key at all.
    Missing,
}

/// The `alert:issue:{id}` mirror record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertCacheRecord {
    pub id: String,
    pub alert_state: AlertState,
    pub state: AlertStatus,
    pub service: String,
    pub level: AlertLevel,
    pub title: String,
    pub labels: Labels,
    pub alert_since: DateTime<Utc>,
}

/// The `service_state:{service}:{version}` mirror record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCacheRecord {
    pub service: String,
    pub version: String,
    pub health_state: HealthState,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Everything the core needs from the hot-state cache.
#[async_trait]
pub trait HotStateCache: Send + Sync {
    /// Seed or fully replace `alert:issue:{id}`, placing it into the index
    /// family implied by its `alert_state`/`state`/`service`. Used by
    /// bootstrap paths and tests that need a record to exist before a CAS
    /// runs against it; production ingestion (out of scope here) is the
    /// normal writer of first instance.
    async fn put_alert_record(&self, record: AlertCacheRecord) -> Result<()>;

    /// Point read of `alert:issue:{id}`.
    async fn get_alert_record(&self, id: &str) -> Result<Option<AlertCacheRecord>>;

    /// CAS `alert:issue:{id}`: if `expected` is `Some`, the current
    /// `alert_state` must match it or the call returns `Conflict`. On match
    /// (or `expected = None`), sets `alert_state` to `new_state`, `state` to
    /// `new_status` (when given), and atomically moves the id out of the
    /// outgoing `alert:index:alert_state:*` bucket into the incoming one, and
    /// (when `new_status` is given) out of `alert:index:{open|closed}` and
    /// `alert:index:svc:{service}:{open|closed}` into their new buckets.
    /// Returns `Missing` if no record exists for `id`.
    async fn cas_alert_state(
        &self,
        id: &str,
        expected: Option<AlertState>,
        new_state: AlertState,
        new_status: Option<AlertStatus>,
    ) -> Result<CasOutcome>;

    /// Point read of `service_state:{service}:{version}`.
    async fn get_service_record(
        &self,
        service: &str,
        version: &str,
    ) -> Result<Option<ServiceCacheRecord>>;

    /// CAS `service_state:{service}:{version}`: a missing prior record is
    /// treated as `"{}"` and created (§4.4 step 5), so this never returns
    /// `Missing` — only `Applied`. Upserts `health_state` (and `resolved_at`
    /// when given) and moves the id between `service_state:index:health:*`
    /// buckets.
    async fn cas_service_health(
        &self,
        service: &str,
        version: &str,
        new_health: HealthState,
        resolved_at: Option<DateTime<Utc>>,
    ) -> Result<CasOutcome>;

    /// Create `observation:{service}:{version}` with `is_active=true`, TTL
    /// `duration + 5min` (§4.6 `StartObservation`). Overwrites any existing
    /// record for the identity — at most one active window per identity is
    /// a caller invariant, not one this call enforces.
    async fn start_observation(&self, window: ObservationWindow) -> Result<()>;

    /// The window for `(service, version)`, if present and not yet expired;
    /// an expired record is opportunistically deleted and reported absent
    /// (§4.6 `CheckObservation`).
    async fn check_observation(
        &self,
        service: &str,
        version: &str,
    ) -> Result<Option<ObservationWindow>>;

    /// Delete the window for `(service, version)`; `NotFound` if absent
    /// (§4.6 `CompleteObservation`). Callers must still perform the state
    /// transitions of §4.5 observation-completion.
    async fn complete_observation(&self, service: &str, version: &str) -> Result<ObservationWindow>;

    /// Delete the window for `(service, version)` if present; absent is a
    /// no-op (§4.6 `CancelObservation`).
    async fn cancel_observation(&self, service: &str, version: &str) -> Result<()>;
}

fn status_for(state: AlertState) -> Option<AlertStatus> {
    match state {
        AlertState::Restored => Some(AlertStatus::Closed),
        AlertState::Pending | AlertState::InProcessing => Some(AlertStatus::Open),
    }
}

/// Target `(alert_state, state)` pair for the common Restored-and-Closed
/// transition used by the drill-down and observation-completion paths
/// (§4.5).
pub fn restored_closed() -> (AlertState, AlertStatus) {
    (AlertState::Restored, status_for(AlertState::Restored).unwrap())
}
