//! Ruleset Manager (C9): CRUD over rules and label-scoped thresholds, with
//! an ordered external-sync-then-persist protocol and change logging
//! (§4.9).
//!
//! Every operation syncs the in-memory materializer first and the durable
//! store second: a missing threshold in the materializer could cause a
//! missed detection, while a missing store row is benign (the next
//! reconcile rebuilds it).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::materializer::ThresholdMaterializer;
use crate::model::{canonical, AlertRule, AlertRuleMeta, ChangeType};
use crate::store::{synthesize_change_log, StateStore};
use crate::{ControlPlaneError, Result};

/// Mediates changes to alert rules and their label-scoped thresholds.
pub struct RulesetManager {
    store: Arc<dyn StateStore>,
    materializer: Arc<ThresholdMaterializer>,
    label_aliases: Arc<HashMap<String, String>>,
}

impl RulesetManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        materializer: Arc<ThresholdMaterializer>,
        label_aliases: Arc<HashMap<String, String>>,
    ) -> Self {
        Self { store, materializer, label_aliases }
    }

    /// `AddAlertRule`: reject an empty name, sync the materializer, then
    /// UPSERT the store row by name. A store failure is still returned even
    /// though the materializer already has the rule (§4.9).
    pub async fn add_alert_rule(&self, rule: &AlertRule) -> Result<()> {
        if rule.name.trim().is_empty() {
            return Err(ControlPlaneError::Invalid("rule name must not be empty".to_string()));
        }
        self.materializer.add_rule(&rule.name);
        self.store.create_rule(rule).await
    }

    /// `DeleteAlertRule`: drop every materialized threshold prefixed
    /// `{name}|`, then delete the store row.
    pub async fn delete_alert_rule(&self, name: &str) -> Result<()> {
        self.materializer.delete_rule(name);
        self.store.delete_rule(name).await
    }

    /// `UpsertRuleMetas`: normalize labels, validate the threshold, sync the
    /// materializer, then transactionally UPSERT the meta plus a change-log
    /// row. Equal-value updates still produce a change-log row — the design
    /// does not suppress them (§9 open question, resolved here).
    pub async fn upsert_rule_metas(&self, mut meta: AlertRuleMeta) -> Result<()> {
        if !meta.threshold.is_finite() {
            return Err(ControlPlaneError::Invalid(format!(
                "threshold must be finite, got {}",
                meta.threshold
            )));
        }

        let canonical_labels = canonical(&meta.labels, &self.label_aliases);
        let prior = self.store.fetch_meta_opt(&meta.alert_name, &canonical_labels).await?;

        self.materializer.sync_meta(
            &meta.alert_name,
            &canonical_labels,
            meta.threshold,
            meta.watch_time,
        );

        meta.updated_at = Utc::now();

        let change_type = if prior.is_some() { ChangeType::Update } else { ChangeType::Create };
        let log = synthesize_change_log(
            &meta.alert_name,
            change_type,
            meta.labels.clone(),
            prior.as_ref().map(|p| p.threshold),
            Some(meta.threshold),
            prior.as_ref().and_then(|p| p.watch_time),
            meta.watch_time,
            meta.updated_at,
        );

        self.store.upsert_meta_and_log(&meta, &canonical_labels, log).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertLevel, ComparisonOp, Labels};
    use crate::store::InMemoryStore;
    use std::time::Duration;

    fn manager() -> RulesetManager {
        RulesetManager::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(ThresholdMaterializer::new()),
            Arc::new(HashMap::new()),
        )
    }

    #[tokio::test]
    async fn add_alert_rule_rejects_empty_name() {
        let mgr = manager();
        let rule = AlertRule {
            name: "  ".to_string(),
            description: "d".to_string(),
            expr: "up".to_string(),
            op: ComparisonOp::Gt,
            severity: AlertLevel::P1,
            watch_time: Duration::from_secs(60),
        };
        let err = mgr.add_alert_rule(&rule).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::Invalid(_)));
    }

    #[tokio::test]
    async fn upsert_rule_metas_writes_create_then_update_logs() {
        let mgr = manager();
        let mut labels = Labels::new();
        labels.insert("service".to_string(), "s3".to_string());
        labels.insert("version".to_string(), "v1.0.4".to_string());

        let meta = AlertRuleMeta {
            alert_name: "latency_p95_P0".to_string(),
            labels: labels.clone(),
            threshold: 450.0,
            watch_time: None,
            updated_at: Utc::now(),
        };
        mgr.upsert_rule_metas(meta.clone()).await.unwrap();

        let mut updated = meta.clone();
        updated.threshold = 445.5;
        mgr.upsert_rule_metas(updated).await.unwrap();

        let metas = mgr.store.fetch_all_metas().await.unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].threshold, 445.5);

        let canonical_labels = canonical(&labels, &HashMap::new());
        let materialized = mgr
            .materializer
            .get("latency_p95_P0", &canonical_labels)
            .unwrap();
        assert_eq!(materialized.threshold, 445.5);
    }

    #[tokio::test]
    async fn upsert_rule_metas_rejects_non_finite_threshold() {
        let mgr = manager();
        let meta = AlertRuleMeta {
            alert_name: "r".to_string(),
            labels: Labels::new(),
            threshold: f64::NAN,
            watch_time: None,
            updated_at: Utc::now(),
        };
        let err = mgr.upsert_rule_metas(meta).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::Invalid(_)));
    }

    #[tokio::test]
    async fn delete_alert_rule_clears_materialized_thresholds() {
        let mgr = manager();
        mgr.materializer.sync_meta("r1", "service=s3", 1.0, None);
        mgr.delete_alert_rule("r1").await.unwrap();
        assert!(mgr.materializer.get("r1", "service=s3").is_none());
    }
}
