//! Remediation Consumer (C5): the single loop over the alert bus. Drives
//! fault healing, drill-down analysis, and observation-window completion
//! (§4.5).
//!
//! Besides draining the bus, this task also sweeps the observation windows
//! it started: the design assigns no fifth background task to observation
//! expiry, so the sweep runs on the same task as the bus loop, guarded by
//! its own ticker inside the same `select!`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bus::AlertBusReceiver;
use crate::cache::{restored_closed, HotStateCache};
use crate::heal::HealActionService;
use crate::logging::{log_error, log_info, log_warn, LogCategory};
use crate::model::{AlertLevel, AlertMessage, AlertState, HealthState};
use crate::monitoring;
use crate::observation::ObservationWindowManager;
use crate::store::StateStore;
use crate::Result;

const COMMENT_AI_ANALYSIS: &str = "AI analysis: automated drill-down initiated for this alert.";
const COMMENT_HEALING_COMPLETED: &str = "healing action completed, entering observation window.";

/// Period between sweeps of tracked observation windows. Coarse relative to
/// the minutes-scale observation durations this design targets.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct RemediationConsumer {
    store: Arc<dyn StateStore>,
    cache: Arc<dyn HotStateCache>,
    observation: Arc<ObservationWindowManager>,
    heal: Arc<HealActionService>,
    observation_duration: Duration,
    tracked_windows: Mutex<HashSet<(String, String)>>,
}

impl RemediationConsumer {
    pub fn new(
        store: Arc<dyn StateStore>,
        cache: Arc<dyn HotStateCache>,
        observation: Arc<ObservationWindowManager>,
        heal: Arc<HealActionService>,
        observation_duration: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            observation,
            heal,
            observation_duration,
            tracked_windows: Mutex::new(HashSet::new()),
        }
    }

    /// Drain `bus` until every sender drops or `cancel` fires, sweeping
    /// tracked observation windows on the side.
    pub async fn run(self: Arc<Self>, mut bus: AlertBusReceiver, cancel: CancellationToken) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log_info(LogCategory::Remediation, "cancelled");
                    return;
                }
                received = bus.recv() => {
                    match received {
                        Some(message) => self.handle_message(message, &cancel).await,
                        None => {
                            log_info(LogCategory::Remediation, "bus closed, all senders dropped");
                            return;
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.sweep_observation_windows().await;
                }
            }
        }
    }

    async fn handle_message(&self, message: AlertMessage, cancel: &CancellationToken) {
        if let Some(window) = self.check_observation(&message.service, &message.version).await {
            log_info(
                LogCategory::Remediation,
                &format!(
                    "alert {} re-entered while observation window for {}/{} was active (started for alert {}); cancelling window",
                    message.id, message.service, message.version, window.alert_id
                ),
            );
            self.cancel_window(&message.service, &message.version).await;
        }

        match message.level {
            AlertLevel::P0 => self.fault_healing_path(&message, cancel).await,
            AlertLevel::P1 | AlertLevel::P2 => self.drill_down_unconditional(&message).await,
        }
    }

    async fn check_observation(
        &self,
        service: &str,
        version: &str,
    ) -> Option<crate::model::ObservationWindow> {
        match self.observation.check(service, version).await {
            Ok(window) => window,
            Err(e) => {
                log_error(LogCategory::Remediation, "check_observation failed", &e);
                None
            }
        }
    }

    async fn cancel_window(&self, service: &str, version: &str) {
        self.tracked_windows.lock().remove(&(service.to_string(), version.to_string()));
        if let Err(e) = self.observation.cancel(service, version).await {
            log_error(LogCategory::Remediation, "cancel_observation failed", &e);
        }
    }

    /// Fault healing path: identify the domain, execute the matching
    /// recipe, and branch on its outcome (§4.5).
    async fn fault_healing_path(&self, message: &AlertMessage, cancel: &CancellationToken) {
        let domain = self.heal.identify_fault_domain(&message.labels);
        let outcome = self.heal.execute(&domain, &message.version, cancel).await;
        if let Some(outcome) = &outcome {
            monitoring::record_heal_outcome(outcome.success);
        }

        match outcome {
            Some(outcome) if outcome.success => {
                if let Err(e) = self
                    .observation
                    .start(&message.service, &message.version, &message.id, self.observation_duration)
                    .await
                {
                    log_error(LogCategory::Remediation, "start_observation failed", &e);
                }
                self.tracked_windows
                    .lock()
                    .insert((message.service.clone(), message.version.clone()));
                self.drill_down_with_observation(message).await;
            }
            _ => self.drill_down_unconditional(message).await,
        }
    }

    /// Appends drill-down and healing-completed comments without marking
    /// the alert Restored — the observation window still needs to hold.
    async fn drill_down_with_observation(&self, message: &AlertMessage) {
        if let Err(e) = self.store.append_comment(&message.id, COMMENT_AI_ANALYSIS).await {
            log_error(LogCategory::Remediation, "append_comment failed", &e);
        }
        if let Err(e) = self.store.append_comment(&message.id, COMMENT_HEALING_COMPLETED).await {
            log_error(LogCategory::Remediation, "append_comment failed", &e);
        }
    }

    /// Terminal drill-down: appends the analysis comment and marks the
    /// alert Restored/Closed in both store and cache (§4.5).
    async fn drill_down_unconditional(&self, message: &AlertMessage) {
        if let Err(e) = self.store.append_comment(&message.id, COMMENT_AI_ANALYSIS).await {
            log_error(LogCategory::Remediation, "append_comment failed", &e);
        }

        if let Err(e) = self.restore_alert(&message.id).await {
            log_error(LogCategory::Remediation, "restore_alert failed", &e);
            return;
        }

        if let Err(e) = self.mark_service_normal(&message.service, &message.version).await {
            log_error(LogCategory::Remediation, "mark_service_normal failed", &e);
        }
    }

    async fn restore_alert(&self, alert_id: &str) -> Result<()> {
        let mut alert = self.store.get_alert(alert_id).await?;
        let now = Utc::now();
        alert.mark_restored(now);
        self.store.upsert_alert(&alert).await?;

        let (new_state, new_status) = restored_closed();
        self.cache.cas_alert_state(alert_id, None, new_state, Some(new_status)).await?;
        Ok(())
    }

    async fn mark_service_normal(&self, service: &str, version: &str) -> Result<()> {
        let now = Utc::now();
        let mut state = match self.store.get_service_state(service, version).await {
            Ok(state) => state,
            Err(_) => crate::model::ServiceState {
                service: service.to_string(),
                version: version.to_string(),
                health_state: HealthState::Normal,
                report_at: None,
                resolved_at: None,
                alert_issue_ids: Vec::new(),
            },
        };
        state.health_state = HealthState::Normal;
        state.resolved_at = Some(now);
        self.store.upsert_service_state(&state).await?;
        self.cache.cas_service_health(service, version, HealthState::Normal, Some(now)).await?;
        Ok(())
    }

    /// For every tracked window, ask whether it is still present. A window
    /// that has silently disappeared (cache TTL/expiry, no explicit
    /// cancellation) means the healing held — perform observation-
    /// completion (§4.5 "observation-completion").
    async fn sweep_observation_windows(&self) {
        let candidates: Vec<(String, String)> = self.tracked_windows.lock().iter().cloned().collect();
        for (service, version) in candidates {
            match self.observation.check(&service, &version).await {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    self.tracked_windows.lock().remove(&(service.clone(), version.clone()));
                    self.complete_observation(&service, &version).await;
                }
                Err(e) => {
                    log_warn(
                        LogCategory::Remediation,
                        &format!("observation sweep check failed for {service}/{version}: {e}"),
                    );
                }
            }
        }
    }

    /// Observation-completion: mark the service Normal and restore any
    /// alert still `InProcessing` referencing it, preserving the invariant
    /// *Normal ⇔ referenced alerts Restored* (§4.5).
    async fn complete_observation(&self, service: &str, version: &str) {
        if let Err(e) = self.mark_service_normal(service, version).await {
            log_error(LogCategory::Remediation, "mark_service_normal failed", &e);
            return;
        }

        let state = match self.store.get_service_state(service, version).await {
            Ok(state) => state,
            Err(e) => {
                log_error(LogCategory::Remediation, "get_service_state failed", &e);
                return;
            }
        };

        for alert_id in &state.alert_issue_ids {
            let alert = match self.store.get_alert(alert_id).await {
                Ok(alert) => alert,
                Err(e) => {
                    log_warn(LogCategory::Remediation, &format!("get_alert({alert_id}) failed: {e}"));
                    continue;
                }
            };
            if alert.alert_state == AlertState::InProcessing {
                if let Err(e) = self.restore_alert(alert_id).await {
                    log_error(LogCategory::Remediation, "restore_alert during completion failed", &e);
                }
            }
        }

        log_info(
            LogCategory::Remediation,
            &format!("observation window for {service}/{version} completed, healing held"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{AlertCacheRecord, InMemoryCache};
    use crate::heal::{FAULT_DOMAIN_SERVICE_VERSION, MockRollbackExecutor};
    use crate::model::{AlertIssue, AlertStatus, HealAction, Labels};
    use crate::store::InMemoryStore;
    use serde_json::json;
    use std::collections::HashMap;

    fn labels(service: &str, version: &str) -> Labels {
        let mut l = Labels::new();
        l.insert("service_name".to_string(), service.to_string());
        l.insert("version".to_string(), version.to_string());
        l
    }

    async fn seed_alert(store: &InMemoryStore, cache: &InMemoryCache, id: &str, service: &str, version: &str) {
        let labels = labels(service, version);
        let alert = AlertIssue {
            id: id.to_string(),
            level: AlertLevel::P0,
            title: "cpu high".to_string(),
            labels: labels.clone(),
            alert_since: Utc::now(),
            resolved_at: None,
            alert_state: AlertState::InProcessing,
            state: AlertStatus::Open,
        };
        store.upsert_alert(&alert).await.unwrap();
        cache
            .put_alert_record(AlertCacheRecord {
                id: id.to_string(),
                alert_state: AlertState::InProcessing,
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

    fn message(id: &str, service: &str, version: &str, level: AlertLevel) -> AlertMessage {
        AlertMessage {
            id: id.to_string(),
            service: service.to_string(),
            version: version.to_string(),
            level,
            title: "cpu high".to_string(),
            alert_since: Utc::now(),
            labels: labels(service, version),
        }
    }

    fn consumer_with_aliases(
        store: Arc<InMemoryStore>,
        cache: Arc<InMemoryCache>,
        aliases: HashMap<String, String>,
    ) -> Arc<RemediationConsumer> {
        let observation = Arc::new(ObservationWindowManager::new(cache.clone()));
        let heal = Arc::new(HealActionService::new(
            store.clone(),
            Arc::new(MockRollbackExecutor { sleep_duration: Duration::from_millis(1) }),
            Arc::new(aliases),
        ));
        Arc::new(RemediationConsumer::new(
            store,
            cache,
            observation,
            heal,
            Duration::from_secs(60),
        ))
    }

    fn aliases() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("service_name".to_string(), "service".to_string());
        m
    }

    #[tokio::test]
    async fn p1_alert_goes_straight_to_drill_down_and_restores() {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(InMemoryCache::new());
        seed_alert(&store, &cache, "a1", "checkout", "v1").await;
        let consumer = consumer_with_aliases(store.clone(), cache.clone(), aliases());

        let cancel = CancellationToken::new();
        consumer
            .handle_message(message("a1", "checkout", "v1", AlertLevel::P1), &cancel)
            .await;

        let alert = store.get_alert("a1").await.unwrap();
        assert_eq!(alert.alert_state, AlertState::Restored);
        assert_eq!(alert.state, AlertStatus::Closed);

        let record = cache.get_alert_record("a1").await.unwrap().unwrap();
        assert_eq!(record.alert_state, AlertState::Restored);
    }

    #[tokio::test]
    async fn p0_successful_rollback_starts_observation_without_restoring() {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(InMemoryCache::new());
        seed_alert(&store, &cache, "a1", "checkout", "v1").await;
        store.seed_heal_action(HealAction {
            id: "h1".to_string(),
            fault_domain: FAULT_DOMAIN_SERVICE_VERSION.to_string(),
            desc: "rollback".to_string(),
            rules: json!({"action": "rollback"}),
        });
        let consumer = consumer_with_aliases(store.clone(), cache.clone(), aliases());

        let cancel = CancellationToken::new();
        consumer
            .handle_message(message("a1", "checkout", "v1", AlertLevel::P0), &cancel)
            .await;

        let alert = store.get_alert("a1").await.unwrap();
        assert_eq!(alert.alert_state, AlertState::InProcessing);

        let window = consumer.observation.check("checkout", "v1").await.unwrap();
        assert!(window.is_some());
    }

    #[tokio::test]
    async fn p0_alert_only_action_falls_through_to_restore() {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(InMemoryCache::new());
        seed_alert(&store, &cache, "a1", "checkout", "v1").await;
        store.seed_heal_action(HealAction {
            id: "h1".to_string(),
            fault_domain: FAULT_DOMAIN_SERVICE_VERSION.to_string(),
            desc: "alert only".to_string(),
            rules: json!({"action": "alert", "message": "page"}),
        });
        let consumer = consumer_with_aliases(store.clone(), cache.clone(), aliases());

        let cancel = CancellationToken::new();
        consumer
            .handle_message(message("a1", "checkout", "v1", AlertLevel::P0), &cancel)
            .await;

        let alert = store.get_alert("a1").await.unwrap();
        assert_eq!(alert.alert_state, AlertState::Restored);
    }

    #[tokio::test]
    async fn reoccurring_alert_cancels_active_window() {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(InMemoryCache::new());
        seed_alert(&store, &cache, "a1", "checkout", "v1").await;
        store.seed_heal_action(HealAction {
            id: "h1".to_string(),
            fault_domain: FAULT_DOMAIN_SERVICE_VERSION.to_string(),
            desc: "rollback".to_string(),
            rules: json!({"action": "rollback"}),
        });
        let consumer = consumer_with_aliases(store.clone(), cache.clone(), aliases());
        let cancel = CancellationToken::new();

        consumer
            .handle_message(message("a1", "checkout", "v1", AlertLevel::P0), &cancel)
            .await;
        assert!(consumer.observation.check("checkout", "v1").await.unwrap().is_some());

        seed_alert(&store, &cache, "a2", "checkout", "v1").await;
        consumer
            .handle_message(message("a2", "checkout", "v1", AlertLevel::P1), &cancel)
            .await;

        assert!(consumer.observation.check("checkout", "v1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_completes_expired_window_and_restores_tracked_alert() {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(InMemoryCache::new());
        seed_alert(&store, &cache, "a1", "checkout", "v1").await;
        store
            .upsert_service_state(&crate::model::ServiceState {
                service: "checkout".to_string(),
                version: "v1".to_string(),
                health_state: crate::model::HealthState::Error,
                report_at: None,
                resolved_at: None,
                alert_issue_ids: vec!["a1".to_string()],
            })
            .await
            .unwrap();

        let observation = Arc::new(ObservationWindowManager::new(cache.clone()));
        observation
            .start("checkout", "v1", "a1", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let heal = Arc::new(HealActionService::new(
            store.clone(),
            Arc::new(MockRollbackExecutor { sleep_duration: Duration::from_millis(1) }),
            Arc::new(aliases()),
        ));
        let consumer = Arc::new(RemediationConsumer::new(
            store.clone(),
            cache.clone(),
            observation,
            heal,
            Duration::from_secs(60),
        ));
        consumer.tracked_windows.lock().insert(("checkout".to_string(), "v1".to_string()));

        consumer.sweep_observation_windows().await;

        let alert = store.get_alert("a1").await.unwrap();
        assert_eq!(alert.alert_state, AlertState::Restored);
        assert!(consumer.tracked_windows.lock().is_empty());
    }
}
