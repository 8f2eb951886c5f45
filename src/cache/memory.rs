//! In-process fake [`HotStateCache`], backed by a locked `HashMap` plus
//! explicit secondary-index sets so tests can assert index membership
//! directly instead of only final record state.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::model::{AlertState, AlertStatus, HealthState, ObservationWindow};
use crate::{ControlPlaneError, Result};

use super::{AlertCacheRecord, CasOutcome, HotStateCache, ServiceCacheRecord};

fn alert_state_key(s: AlertState) -> &'static str {
    match s {
        AlertState::Pending => "Pending",
        AlertState::InProcessing => "InProcessing",
        AlertState::Restored => "Restored",
    }
}

fn status_key(s: AlertStatus) -> &'static str {
    match s {
        AlertStatus::Open => "open",
        AlertStatus::Closed => "closed",
    }
}

fn health_key(h: HealthState) -> &'static str {
    match h {
        HealthState::Normal => "Normal",
        HealthState::Warning => "Warning",
        HealthState::Error => "Error",
    }
}

#[derive(Default)]
struct Inner {
    alerts: HashMap<String, AlertCacheRecord>,
    services: HashMap<(String, String), ServiceCacheRecord>,
    alert_state_index: HashMap<&'static str, HashSet<String>>,
    status_index: HashMap<&'static str, HashSet<String>>,
    svc_status_index: HashMap<(String, &'static str), HashSet<String>>,
    health_index: HashMap<&'static str, HashSet<(String, String)>>,
    observations: HashMap<(String, String), ObservationWindow>,
}

impl Inner {
    fn move_alert_state(&mut self, id: &str, from: Option<&'static str>, to: &'static str) {
        if let Some(from) = from {
            self.alert_state_index.entry(from).or_default().remove(id);
        }
        self.alert_state_index.entry(to).or_default().insert(id.to_string());
    }

    fn move_status(&mut self, id: &str, from: Option<&'static str>, to: &'static str) {
        if let Some(from) = from {
            self.status_index.entry(from).or_default().remove(id);
        }
        self.status_index.entry(to).or_default().insert(id.to_string());
    }

    fn move_svc_status(&mut self, service: &str, id: &str, from: Option<&'static str>, to: &'static str) {
        if let Some(from) = from {
            self.svc_status_index
                .entry((service.to_string(), from))
                .or_default()
                .remove(id);
        }
        self.svc_status_index
            .entry((service.to_string(), to))
            .or_default()
            .insert(id.to_string());
    }

    fn move_health(&mut self, key: (String, String), from: Option<&'static str>, to: &'static str) {
        if let Some(from) = from {
            self.health_index.entry(from).or_default().remove(&key);
        }
        self.health_index.entry(to).or_default().insert(key);
    }
}

/// In-memory [`HotStateCache`] fake for tests and local development.
#[derive(Default)]
pub struct InMemoryCache {
    inner: Mutex<Inner>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of ids currently in `alert:index:alert_state:{state}`.
    pub fn alert_state_index(&self, state: AlertState) -> HashSet<String> {
        self.inner
            .lock()
            .alert_state_index
            .get(alert_state_key(state))
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of ids currently in `alert:index:{open|closed}`.
    pub fn status_index(&self, status: AlertStatus) -> HashSet<String> {
        self.inner
            .lock()
            .status_index
            .get(status_key(status))
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of ids currently in `alert:index:svc:{service}:{open|closed}`.
    pub fn svc_status_index(&self, service: &str, status: AlertStatus) -> HashSet<String> {
        self.inner
            .lock()
            .svc_status_index
            .get(&(service.to_string(), status_key(status)))
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of `(service, version)` pairs in
    /// `service_state:index:health:{state}`.
    pub fn health_index(&self, health: HealthState) -> HashSet<(String, String)> {
        self.inner
            .lock()
            .health_index
            .get(health_key(health))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl HotStateCache for InMemoryCache {
    async fn put_alert_record(&self, record: AlertCacheRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        let id = record.id.clone();
        let service = record.service.clone();
        let new_state_key = alert_state_key(record.alert_state);
        let new_status_key = status_key(record.state);
        inner.move_alert_state(&id, None, new_state_key);
        inner.move_status(&id, None, new_status_key);
        inner.move_svc_status(&service, &id, None, new_status_key);
        inner.alerts.insert(id, record);
        Ok(())
    }

    async fn get_alert_record(&self, id: &str) -> Result<Option<AlertCacheRecord>> {
        Ok(self.inner.lock().alerts.get(id).cloned())
    }

    async fn cas_alert_state(
        &self,
        id: &str,
        expected: Option<AlertState>,
        new_state: AlertState,
        new_status: Option<AlertStatus>,
    ) -> Result<CasOutcome> {
        let mut inner = self.inner.lock();
        let Some(record) = inner.alerts.get(id).cloned() else {
            return Ok(CasOutcome::Missing);
        };
        if let Some(expected) = expected {
            if record.alert_state != expected {
                return Ok(CasOutcome::Conflict);
            }
        }

        let old_state_key = alert_state_key(record.alert_state);
        let new_state_key = alert_state_key(new_state);
        inner.move_alert_state(id, Some(old_state_key), new_state_key);

        if let Some(new_status) = new_status {
            let old_status_key = status_key(record.state);
            let new_status_key = status_key(new_status);
            inner.move_status(id, Some(old_status_key), new_status_key);
            inner.move_svc_status(&record.service, id, Some(old_status_key), new_status_key);
        }

        let entry = inner.alerts.get_mut(id).unwrap();
        entry.alert_state = new_state;
        if let Some(new_status) = new_status {
            entry.state = new_status;
        }
        Ok(CasOutcome::Applied)
    }

    async fn get_service_record(
        &self,
        service: &str,
        version: &str,
    ) -> Result<Option<ServiceCacheRecord>> {
        Ok(self
            .inner
            .lock()
            .services
            .get(&(service.to_string(), version.to_string()))
            .cloned())
    }

    async fn cas_service_health(
        &self,
        service: &str,
        version: &str,
        new_health: HealthState,
        resolved_at: Option<DateTime<Utc>>,
    ) -> Result<CasOutcome> {
        let mut inner = self.inner.lock();
        let key = (service.to_string(), version.to_string());
        let old_health_key = inner.services.get(&key).map(|r| health_key(r.health_state));
        inner.move_health(key.clone(), old_health_key, health_key(new_health));

        inner
            .services
            .entry(key)
            .and_modify(|r| {
                r.health_state = new_health;
                if resolved_at.is_some() {
                    r.resolved_at = resolved_at;
                }
            })
            .or_insert(ServiceCacheRecord {
                service: service.to_string(),
                version: version.to_string(),
                health_state: new_health,
                resolved_at,
            });
        Ok(CasOutcome::Applied)
    }

    async fn start_observation(&self, window: ObservationWindow) -> Result<()> {
        let key = (window.service.clone(), window.version.clone());
        self.inner.lock().observations.insert(key, window);
        Ok(())
    }

    async fn check_observation(
        &self,
        service: &str,
        version: &str,
    ) -> Result<Option<ObservationWindow>> {
        let mut inner = self.inner.lock();
        let key = (service.to_string(), version.to_string());
        match inner.observations.get(&key) {
            Some(w) if w.is_expired(Utc::now()) => {
                inner.observations.remove(&key);
                Ok(None)
            }
            Some(w) => Ok(Some(w.clone())),
            None => Ok(None),
        }
    }

    async fn complete_observation(&self, service: &str, version: &str) -> Result<ObservationWindow> {
        let key = (service.to_string(), version.to_string());
        self.inner.lock().observations.remove(&key).ok_or_else(|| {
            ControlPlaneError::NotFound(format!("observation:{service}:{version}"))
        })
    }

    async fn cancel_observation(&self, service: &str, version: &str) -> Result<()> {
        let key = (service.to_string(), version.to_string());
        self.inner.lock().observations.remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertLevel, Labels};

    fn sample_record(id: &str) -> AlertCacheRecord {
        AlertCacheRecord {
            id: id.to_string(),
            alert_state: AlertState::Pending,
            state: AlertStatus::Open,
            service: "checkout".to_string(),
            level: AlertLevel::P0,
            title: "cpu high".to_string(),
            labels: Labels::new(),
            alert_since: Utc::now(),
        }
    }

    #[tokio::test]
    async fn cas_moves_alert_state_index() {
        let cache = InMemoryCache::new();
        cache.put_alert_record(sample_record("a1")).await.unwrap();
        assert!(cache.alert_state_index(AlertState::Pending).contains("a1"));

        let outcome = cache
            .cas_alert_state(
                "a1",
                Some(AlertState::Pending),
                AlertState::InProcessing,
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Applied);
        assert!(!cache.alert_state_index(AlertState::Pending).contains("a1"));
        assert!(cache.alert_state_index(AlertState::InProcessing).contains("a1"));
    }

    #[tokio::test]
    async fn cas_conflict_when_expected_state_mismatches() {
        let cache = InMemoryCache::new();
        cache.put_alert_record(sample_record("a1")).await.unwrap();
        cache
            .cas_alert_state("a1", Some(AlertState::Pending), AlertState::InProcessing, None)
            .await
            .unwrap();

        let second = cache
            .cas_alert_state("a1", Some(AlertState::Pending), AlertState::InProcessing, None)
            .await
            .unwrap();
        assert_eq!(second, CasOutcome::Conflict);
    }

    #[tokio::test]
    async fn cas_missing_for_unknown_id() {
        let cache = InMemoryCache::new();
        let outcome = cache
            .cas_alert_state("ghost", None, AlertState::Restored, None)
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Missing);
    }

    #[tokio::test]
    async fn cas_restore_moves_open_and_svc_indexes() {
        let cache = InMemoryCache::new();
        cache.put_alert_record(sample_record("a1")).await.unwrap();
        let (state, status) = super::super::restored_closed();
        cache
            .cas_alert_state("a1", None, state, Some(status))
            .await
            .unwrap();

        assert!(cache.status_index(AlertStatus::Closed).contains("a1"));
        assert!(!cache.status_index(AlertStatus::Open).contains("a1"));
        assert!(cache.svc_status_index("checkout", AlertStatus::Closed).contains("a1"));
    }

    #[tokio::test]
    async fn cas_service_health_creates_missing_record() {
        let cache = InMemoryCache::new();
        let outcome = cache
            .cas_service_health("checkout", "v1", HealthState::Error, None)
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Applied);
        let record = cache.get_service_record("checkout", "v1").await.unwrap().unwrap();
        assert_eq!(record.health_state, HealthState::Error);
        assert!(cache.health_index(HealthState::Error).contains(&("checkout".to_string(), "v1".to_string())));
    }
}
