//! State Store (C1): canonical persistence for alerts, services, rules,
//! thresholds, comments, and change logs.
//!
//! Not-found on a list query is an empty `Vec`, never an error; not-found on
//! a point read is [`crate::ControlPlaneError::NotFound`]. Every write here
//! is a single statement except [`StateStore::upsert_meta_and_log`], which
//! must be transactional (upsert-meta-plus-changelog pair, §4.9).

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    AlertIssue, AlertRule, AlertRuleMeta, ChangeLog, ChangeType, HealAction, ServiceState,
};
use crate::Result;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Everything the core needs from the durable relational store.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Up to `batch` rows with `alert_state = Pending`, ordered by
    /// `alert_since ASC` (§4.4 step 1).
    async fn fetch_pending_alerts(&self, batch: usize) -> Result<Vec<AlertIssue>>;

    /// All alerts with `alert_state IN {InProcessing, Pending}` (§4.8 step 4).
    async fn fetch_non_terminal_alerts(&self) -> Result<Vec<AlertIssue>>;

    /// Point read by id; `NotFound` if absent.
    async fn get_alert(&self, id: &str) -> Result<AlertIssue>;

    /// UPSERT the full alert-issue row.
    async fn upsert_alert(&self, alert: &AlertIssue) -> Result<()>;

    /// Idempotent comment append, deduplicated on `(issue_id, content)`.
    async fn append_comment(&self, issue_id: &str, content: &str) -> Result<()>;

    /// UPSERT the `(service, version)`-keyed service-health row.
    async fn upsert_service_state(&self, state: &ServiceState) -> Result<()>;

    /// Point read by `(service, version)`; `NotFound` if absent.
    async fn get_service_state(&self, service: &str, version: &str) -> Result<ServiceState>;

    /// All rules in the registry.
    async fn fetch_all_rules(&self) -> Result<Vec<AlertRule>>;

    /// UPSERT by name (used by `RulesetManager::add_alert_rule` and
    /// bootstrap).
    async fn create_rule(&self, rule: &AlertRule) -> Result<()>;

    /// Delete by name; absent is not an error.
    async fn delete_rule(&self, name: &str) -> Result<()>;

    /// All metas in the registry.
    async fn fetch_all_metas(&self) -> Result<Vec<AlertRuleMeta>>;

    /// Metas whose `labels` JSON contains `{"service": service}` (§4.1's
    /// JSON-containment requirement), across all versions.
    async fn fetch_metas_by_service(&self, service: &str) -> Result<Vec<AlertRuleMeta>>;

    /// The exact meta for `(alert_name, canonical(labels))`; `NotFound` if
    /// absent.
    async fn fetch_meta_exact(&self, alert_name: &str, canonical_labels: &str) -> Result<AlertRuleMeta>;

    /// Fetch the current meta, if any, without erroring when absent.
    async fn fetch_meta_opt(
        &self,
        alert_name: &str,
        canonical_labels: &str,
    ) -> Result<Option<AlertRuleMeta>>;

    /// Transactional UPSERT of `meta` plus an append of `log`
    /// (§4.9 `UpsertRuleMetas` step (e)). `canonical_labels` is the caller's
    /// already alias-resolved key — the store must not recompute it under a
    /// different alias table, or the row's identity drifts from what
    /// `fetch_meta_exact`/`fetch_meta_opt` will look it up under.
    async fn upsert_meta_and_log(
        &self,
        meta: &AlertRuleMeta,
        canonical_labels: &str,
        log: ChangeLog,
    ) -> Result<()>;

    /// Append-only change-log insert outside of the meta-upsert transaction,
    /// used by the anomaly scheduler after a successful external sync
    /// (§4.8 step 11).
    async fn insert_change_log(&self, log: ChangeLog) -> Result<()>;

    /// The single heal-action row for `fault_domain`; `NotFound` if absent.
    async fn fetch_heal_action(&self, fault_domain: &str) -> Result<HealAction>;

    /// Conflict-do-nothing insert used by bootstrap.
    async fn insert_rule_if_absent(&self, rule: &AlertRule) -> Result<()>;
}

/// Build a [`ChangeLog`] for a threshold/watch update, synthesizing the id
/// as `{alert_name}-{unix_nano}` (§4.8 step 11).
pub fn synthesize_change_log(
    alert_name: &str,
    change_type: ChangeType,
    labels: crate::model::Labels,
    old_threshold: Option<f64>,
    new_threshold: Option<f64>,
    old_watch: Option<std::time::Duration>,
    new_watch: Option<std::time::Duration>,
    now: DateTime<Utc>,
) -> ChangeLog {
    ChangeLog {
        id: format!("{alert_name}-{}", now.timestamp_nanos_opt().unwrap_or(0)),
        alert_name: alert_name.to_string(),
        change_type,
        labels,
        old_threshold,
        new_threshold,
        old_watch,
        new_watch,
        change_time: now,
    }
}
