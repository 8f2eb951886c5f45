//! Pending Scheduler (C4): periodically drains `Pending` rows, publishes to
//! the bus, and atomically advances cache state (§4.4).

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bus::AlertBusSender;
use crate::cache::{CasOutcome, HotStateCache};
use crate::config::PendingSchedulerConfig;
use crate::logging::{log_error, log_info, log_warn, LogCategory};
use crate::model::{derive_health_state, lookup_label, AlertIssue, AlertMessage, AlertState};
use crate::monitoring::{self, NoiseSuppressor};
use crate::store::StateStore;
use crate::Result;

/// Drives the Pending -> InProcessing transition and publishes
/// [`AlertMessage`]s for the remediation consumer.
pub struct PendingScheduler {
    store: Arc<dyn StateStore>,
    cache: Arc<dyn HotStateCache>,
    bus: AlertBusSender,
    config: PendingSchedulerConfig,
    label_aliases: Arc<HashMap<String, String>>,
    noise: NoiseSuppressor,
}

impl PendingScheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        cache: Arc<dyn HotStateCache>,
        bus: AlertBusSender,
        config: PendingSchedulerConfig,
        label_aliases: Arc<HashMap<String, String>>,
    ) -> Self {
        let noise = NoiseSuppressor::new(config.interval * 10);
        Self { store, cache, bus, config, label_aliases, noise }
    }

    /// Spawn `config.workers` independent ticker tasks, each honoring
    /// `cancel`. Returns once every worker has observed cancellation and
    /// finished its in-flight tick (§4.4, §5 T1).
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let worker_count = self.config.workers.max(1);
        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { this.worker_loop(worker_id, cancel).await }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn worker_loop(&self, worker_id: usize, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log_info(LogCategory::PendingScheduler, &format!("worker {worker_id} cancelled"));
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        log_error(LogCategory::PendingScheduler, "tick failed", &e);
                    }
                }
            }
        }
    }

    /// One tick: fetch up to `batch` pending rows, ordered by
    /// `alert_since ASC`, and drain each independently (§4.4 steps 1-5).
    pub async fn tick(&self) -> Result<()> {
        let alerts = self.store.fetch_pending_alerts(self.config.batch).await?;
        monitoring::record_tick("pending", alerts.len());
        for alert in alerts {
            self.process_one(alert).await;
        }
        Ok(())
    }

    async fn process_one(&self, alert: AlertIssue) {
        let service = lookup_label(&alert.labels, "service", &self.label_aliases).unwrap_or_default();
        let version = lookup_label(&alert.labels, "version", &self.label_aliases).unwrap_or_default();

        let message = AlertMessage {
            id: alert.id.clone(),
            service: service.clone(),
            version: version.clone(),
            level: alert.level,
            title: alert.title.clone(),
            alert_since: alert.alert_since,
            labels: alert.labels.clone(),
        };

        if self.bus.publish(message).is_err() {
            monitoring::record_bus_publish(true);
            if self.noise.should_log("pending.bus_full", &alert.id) {
                log_info(
                    LogCategory::PendingScheduler,
                    &format!("bus full, skipping transition for alert {} this tick", alert.id),
                );
            }
            return;
        }
        monitoring::record_bus_publish(false);

        match self
            .cache
            .cas_alert_state(&alert.id, Some(AlertState::Pending), AlertState::InProcessing, None)
            .await
        {
            Ok(CasOutcome::Applied) => {}
            Ok(CasOutcome::Conflict) => {
                monitoring::record_cas_conflict("pending");
                log_info(
                    LogCategory::PendingScheduler,
                    &format!("alert {} already advanced by another worker", alert.id),
                );
                return;
            }
            Ok(CasOutcome::Missing) => {
                if self.noise.should_log("pending.cache_missing", &alert.id) {
                    log_warn(
                        LogCategory::PendingScheduler,
                        &format!("alert {} missing from cache, skipping health update", alert.id),
                    );
                }
                return;
            }
            Err(e) => {
                log_error(LogCategory::PendingScheduler, "cas_alert_state failed", &e);
                return;
            }
        }

        if service.is_empty() {
            return;
        }

        let target_health = derive_health_state(alert.level);
        if let Err(e) = self.cache.cas_service_health(&service, &version, target_health, None).await {
            log_error(LogCategory::PendingScheduler, "cas_service_health failed", &e);
            return;
        }

        if let Err(e) = self
            .record_service_degradation(&service, &version, &alert.id, target_health)
            .await
        {
            log_error(LogCategory::PendingScheduler, "upsert_service_state failed", &e);
        }
    }

    /// Persist the durable service-health row, tracking `alert_id` in
    /// `alert_issue_ids` so a later observation-completion or restore path
    /// can find and restore the alerts that drove a service out of Normal.
    async fn record_service_degradation(
        &self,
        service: &str,
        version: &str,
        alert_id: &str,
        health: crate::model::HealthState,
    ) -> Result<()> {
        let mut state = match self.store.get_service_state(service, version).await {
            Ok(state) => state,
            Err(_) => crate::model::ServiceState {
                service: service.to_string(),
                version: version.to_string(),
                health_state: health,
                report_at: None,
                resolved_at: None,
                alert_issue_ids: Vec::new(),
            },
        };
        state.health_state = health;
        state.resolved_at = None;
        if !state.alert_issue_ids.iter().any(|id| id == alert_id) {
            state.alert_issue_ids.push(alert_id.to_string());
        }
        self.store.upsert_service_state(&state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{AlertCacheRecord, InMemoryCache};
    use crate::model::{AlertLevel, AlertStatus, Labels};
    use crate::store::InMemoryStore;
    use chrono::Utc;

    fn labels_with(service: &str, version: &str) -> Labels {
        let mut l = Labels::new();
        l.insert("service".to_string(), service.to_string());
        l.insert("version".to_string(), version.to_string());
        l
    }

    async fn seed(store: &InMemoryStore, cache: &InMemoryCache, id: &str, service: &str, version: &str) {
        let labels = labels_with(service, version);
        let alert = AlertIssue {
            id: id.to_string(),
            level: AlertLevel::P0,
            title: "cpu high".to_string(),
            labels: labels.clone(),
            alert_since: Utc::now(),
            resolved_at: None,
            alert_state: AlertState::Pending,
            state: AlertStatus::Open,
        };
        store.upsert_alert(&alert).await.unwrap();
        cache
            .put_alert_record(AlertCacheRecord {
                id: id.to_string(),
                alert_state: AlertState::Pending,
                state: AlertStatus::Open,
                service: service.to_string(),
                level: AlertLevel::P0,
                title: "cpu high".to_string(),
                labels,
                alert_since: alert.alert_since,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn tick_advances_alert_and_service_health() {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(InMemoryCache::new());
        seed(&store, &cache, "a1", "checkout", "v1").await;

        let (tx, mut rx) = crate::bus::channel(16);
        let scheduler = PendingScheduler::new(
            store.clone(),
            cache.clone(),
            tx,
            PendingSchedulerConfig::default(),
            Arc::new(HashMap::new()),
        );
        scheduler.tick().await.unwrap();

        let published = rx.recv().await.unwrap();
        assert_eq!(published.id, "a1");

        let record = cache.get_alert_record("a1").await.unwrap().unwrap();
        assert_eq!(record.alert_state, AlertState::InProcessing);

        let service_record = cache.get_service_record("checkout", "v1").await.unwrap().unwrap();
        assert_eq!(service_record.health_state, crate::model::HealthState::Error);
    }

    #[tokio::test]
    async fn full_bus_skips_state_transition() {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(InMemoryCache::new());
        seed(&store, &cache, "a1", "checkout", "v1").await;
        seed(&store, &cache, "a2", "checkout", "v1").await;

        let (tx, _rx) = crate::bus::channel(1);
        // Fill the single slot so the scheduler's own publish attempts fail.
        tx.publish(crate::model::AlertMessage {
            id: "filler".to_string(),
            service: "checkout".to_string(),
            version: "v1".to_string(),
            level: AlertLevel::P0,
            title: "filler".to_string(),
            alert_since: Utc::now(),
            labels: Labels::new(),
        })
        .unwrap();

        let scheduler = PendingScheduler::new(
            store.clone(),
            cache.clone(),
            tx,
            PendingSchedulerConfig::default(),
            Arc::new(HashMap::new()),
        );
        scheduler.tick().await.unwrap();

        let record = cache.get_alert_record("a1").await.unwrap().unwrap();
        assert_eq!(record.alert_state, AlertState::Pending);
    }

    #[tokio::test]
    async fn second_cas_on_same_row_is_benign_conflict() {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(InMemoryCache::new());
        seed(&store, &cache, "a1", "checkout", "v1").await;

        let outcome_a = cache
            .cas_alert_state("a1", Some(AlertState::Pending), AlertState::InProcessing, None)
            .await
            .unwrap();
        let outcome_b = cache
            .cas_alert_state("a1", Some(AlertState::Pending), AlertState::InProcessing, None)
            .await
            .unwrap();
        assert_eq!(outcome_a, CasOutcome::Applied);
        assert_eq!(outcome_b, CasOutcome::Conflict);
    }
}
