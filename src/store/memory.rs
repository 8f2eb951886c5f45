//! In-process fake [`StateStore`], backed by locked `HashMap`s.
//!
//! Used by every test in this crate in place of a live Postgres instance;
//! the production binary always wires [`super::PostgresStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::model::{
    AlertIssue, AlertRule, AlertRuleMeta, ChangeLog, HealAction, Labels, ServiceState,
};
use crate::{ControlPlaneError, Result};

use super::StateStore;

#[derive(Default)]
struct Inner {
    alerts: HashMap<String, AlertIssue>,
    comments: HashMap<String, Vec<String>>,
    service_states: HashMap<(String, String), ServiceState>,
    rules: HashMap<String, AlertRule>,
    metas: HashMap<(String, String), AlertRuleMeta>,
    change_logs: Vec<ChangeLog>,
    heal_actions: HashMap<String, HealAction>,
}

/// In-memory [`StateStore`] fake for tests and local development.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a heal action, used by tests that exercise C7 directly.
    pub fn seed_heal_action(&self, action: HealAction) {
        self.inner.write().heal_actions.insert(action.fault_domain.clone(), action);
    }

    /// Seed an alert rule, used by bootstrap tests.
    pub fn seed_rule(&self, rule: AlertRule) {
        self.inner.write().rules.insert(rule.name.clone(), rule);
    }

    /// Snapshot of every change log recorded so far, oldest first.
    pub fn change_logs(&self) -> Vec<ChangeLog> {
        self.inner.read().change_logs.clone()
    }
}

fn meta_key(alert_name: &str, canonical_labels: &str) -> (String, String) {
    (alert_name.to_string(), canonical_labels.to_string())
}

fn labels_contain_service(labels: &Labels, service: &str) -> bool {
    labels.get("service").map(|v| v == service).unwrap_or(false)
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn fetch_pending_alerts(&self, batch: usize) -> Result<Vec<AlertIssue>> {
        let inner = self.inner.read();
        let mut pending: Vec<AlertIssue> = inner
            .alerts
            .values()
            .filter(|a| a.alert_state == crate::model::AlertState::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|a| a.alert_since);
        pending.truncate(batch);
        Ok(pending)
    }

    async fn fetch_non_terminal_alerts(&self) -> Result<Vec<AlertIssue>> {
        let inner = self.inner.read();
        Ok(inner
            .alerts
            .values()
            .filter(|a| {
                matches!(
                    a.alert_state,
                    crate::model::AlertState::Pending | crate::model::AlertState::InProcessing
                )
            })
            .cloned()
            .collect())
    }

    async fn get_alert(&self, id: &str) -> Result<AlertIssue> {
        self.inner
            .read()
            .alerts
            .get(id)
            .cloned()
            .ok_or_else(|| ControlPlaneError::NotFound(format!("alert_issues id={id}")))
    }

    async fn upsert_alert(&self, alert: &AlertIssue) -> Result<()> {
        self.inner.write().alerts.insert(alert.id.clone(), alert.clone());
        Ok(())
    }

    async fn append_comment(&self, issue_id: &str, content: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner.comments.entry(issue_id.to_string()).or_default();
        if !entry.iter().any(|c| c == content) {
            entry.push(content.to_string());
        }
        Ok(())
    }

    async fn upsert_service_state(&self, state: &ServiceState) -> Result<()> {
        self.inner
            .write()
            .service_states
            .insert((state.service.clone(), state.version.clone()), state.clone());
        Ok(())
    }

    async fn get_service_state(&self, service: &str, version: &str) -> Result<ServiceState> {
        self.inner
            .read()
            .service_states
            .get(&(service.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| {
                ControlPlaneError::NotFound(format!("service_states {service}:{version}"))
            })
    }

    async fn fetch_all_rules(&self) -> Result<Vec<AlertRule>> {
        Ok(self.inner.read().rules.values().cloned().collect())
    }

    async fn create_rule(&self, rule: &AlertRule) -> Result<()> {
        self.inner.write().rules.insert(rule.name.clone(), rule.clone());
        Ok(())
    }

    async fn delete_rule(&self, name: &str) -> Result<()> {
        self.inner.write().rules.remove(name);
        Ok(())
    }

    async fn fetch_all_metas(&self) -> Result<Vec<AlertRuleMeta>> {
        Ok(self.inner.read().metas.values().cloned().collect())
    }

    async fn fetch_metas_by_service(&self, service: &str) -> Result<Vec<AlertRuleMeta>> {
        Ok(self
            .inner
            .read()
            .metas
            .values()
            .filter(|m| labels_contain_service(&m.labels, service))
            .cloned()
            .collect())
    }

    async fn fetch_meta_exact(&self, alert_name: &str, canonical_labels: &str) -> Result<AlertRuleMeta> {
        self.fetch_meta_opt(alert_name, canonical_labels)
            .await?
            .ok_or_else(|| {
                ControlPlaneError::NotFound(format!(
                    "alert_rule_metas {alert_name}/{canonical_labels}"
                ))
            })
    }

    async fn fetch_meta_opt(
        &self,
        alert_name: &str,
        canonical_labels: &str,
    ) -> Result<Option<AlertRuleMeta>> {
        Ok(self
            .inner
            .read()
            .metas
            .get(&meta_key(alert_name, canonical_labels))
            .cloned())
    }

    async fn upsert_meta_and_log(
        &self,
        meta: &AlertRuleMeta,
        canonical_labels: &str,
        log: ChangeLog,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        inner
            .metas
            .insert(meta_key(&meta.alert_name, canonical_labels), meta.clone());
        inner.change_logs.push(log);
        Ok(())
    }

    async fn insert_change_log(&self, log: ChangeLog) -> Result<()> {
        self.inner.write().change_logs.push(log);
        Ok(())
    }

    async fn fetch_heal_action(&self, fault_domain: &str) -> Result<HealAction> {
        self.inner
            .read()
            .heal_actions
            .get(fault_domain)
            .cloned()
            .ok_or_else(|| ControlPlaneError::NotFound(format!("heal_actions type={fault_domain}")))
    }

    async fn insert_rule_if_absent(&self, rule: &AlertRule) -> Result<()> {
        let mut inner = self.inner.write();
        inner.rules.entry(rule.name.clone()).or_insert_with(|| rule.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertIssue, AlertLevel, AlertState, AlertStatus};
    use chrono::Utc;

    fn sample_alert(id: &str) -> AlertIssue {
        AlertIssue {
            id: id.to_string(),
            level: AlertLevel::P0,
            title: "cpu high".to_string(),
            labels: Labels::new(),
            alert_since: Utc::now(),
            resolved_at: None,
            alert_state: AlertState::Pending,
            state: AlertStatus::Open,
        }
    }

    #[tokio::test]
    async fn fetch_pending_respects_batch_and_order() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            let mut a = sample_alert(&format!("a{i}"));
            a.alert_since = Utc::now() + chrono::Duration::seconds(i);
            store.upsert_alert(&a).await.unwrap();
        }
        let page = store.fetch_pending_alerts(3).await.unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].id, "a0");
    }

    #[tokio::test]
    async fn get_alert_not_found_is_typed_error() {
        let store = InMemoryStore::new();
        let err = store.get_alert("missing").await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::NotFound(_)));
    }

    #[tokio::test]
    async fn append_comment_is_idempotent() {
        let store = InMemoryStore::new();
        store.append_comment("issue-1", "rolled back").await.unwrap();
        store.append_comment("issue-1", "rolled back").await.unwrap();
        assert_eq!(store.inner.read().comments["issue-1"].len(), 1);
    }

    #[tokio::test]
    async fn insert_rule_if_absent_does_not_overwrite() {
        let store = InMemoryStore::new();
        let rule = crate::model::AlertRule {
            name: "r1".to_string(),
            description: "d".to_string(),
            expr: "up".to_string(),
            op: crate::model::ComparisonOp::Gt,
            severity: AlertLevel::P1,
            watch_time: std::time::Duration::from_secs(60),
        };
        store.insert_rule_if_absent(&rule).await.unwrap();
        let mut changed = rule.clone();
        changed.description = "different".to_string();
        store.insert_rule_if_absent(&changed).await.unwrap();
        let rules = store.fetch_all_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].description, "d");
    }
}
