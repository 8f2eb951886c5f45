//! Bootstrap (§6): seeds alert rules and their label-scoped thresholds from
//! an optional JSON file, pushing each new rule to the external ruleset
//! service before recording it locally.
//!
//! `{rules:[{name, description, expr, op, severity, watch_time, metas:[{labels,
//! threshold}, ...]}, ...]}`. Only rules not already present in the store are
//! processed; a rule already on file is assumed already synced externally.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;

use crate::external::ruleset_client::{MetaPutEntry, PutAlertRuleBody, PutRuleMetasBody, RulesetClient};
use crate::logging::{log_info, log_warn, LogCategory};
use crate::model::{AlertLevel, AlertRule, AlertRuleMeta, ComparisonOp, Labels};
use crate::ruleset::RulesetManager;
use crate::store::StateStore;
use crate::Result;

#[derive(Debug, Clone, Deserialize)]
struct BootstrapFile {
    rules: Vec<BootstrapRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct BootstrapRule {
    name: String,
    description: String,
    expr: String,
    op: ComparisonOp,
    severity: AlertLevel,
    watch_time: u64,
    #[serde(default)]
    metas: Vec<BootstrapMeta>,
}

#[derive(Debug, Clone, Deserialize)]
struct BootstrapMeta {
    labels: Labels,
    threshold: f64,
}

/// Load `path`, and for every rule absent from the store: push it (and its
/// metas) to the external ruleset service, then record both locally with
/// conflict-do-nothing semantics (§6).
pub async fn run(
    path: &str,
    store: &Arc<dyn StateStore>,
    ruleset: &Arc<RulesetManager>,
    ruleset_client: &Arc<dyn RulesetClient>,
) -> Result<()> {
    let raw = fs::read_to_string(path)
        .map_err(|e| crate::ControlPlaneError::Invalid(format!("bootstrap file {path}: {e}")))?;
    let file: BootstrapFile = serde_json::from_str(&raw)
        .map_err(|e| crate::ControlPlaneError::Invalid(format!("bootstrap file {path} is not valid JSON: {e}")))?;

    let existing = store.fetch_all_rules().await?;
    let existing_names: std::collections::HashSet<&str> =
        existing.iter().map(|r| r.name.as_str()).collect();

    for rule in file.rules {
        if existing_names.contains(rule.name.as_str()) {
            continue;
        }
        if let Err(e) = seed_one(&rule, store, ruleset, ruleset_client).await {
            log_warn(LogCategory::System, &format!("bootstrap of rule {} failed: {e}", rule.name));
        }
    }
    Ok(())
}

async fn seed_one(
    rule: &BootstrapRule,
    store: &Arc<dyn StateStore>,
    ruleset: &Arc<RulesetManager>,
    ruleset_client: &Arc<dyn RulesetClient>,
) -> Result<()> {
    ruleset_client
        .put_alert_rule(
            &rule.name,
            PutAlertRuleBody {
                description: rule.description.clone(),
                expr: rule.expr.clone(),
                op: rule.op,
                severity: rule.severity,
                watch_time: rule.watch_time,
            },
        )
        .await?;

    if !rule.metas.is_empty() {
        let metas = rule
            .metas
            .iter()
            .map(|m| MetaPutEntry {
                labels: serde_json::to_string(&m.labels).unwrap_or_default(),
                threshold: m.threshold,
            })
            .collect();
        ruleset_client
            .put_alert_rule_metas(PutRuleMetasBody { rule_name: rule.name.clone(), metas })
            .await?;
    }

    store
        .insert_rule_if_absent(&AlertRule {
            name: rule.name.clone(),
            description: rule.description.clone(),
            expr: rule.expr.clone(),
            op: rule.op,
            severity: rule.severity,
            watch_time: std::time::Duration::from_secs(rule.watch_time),
        })
        .await?;

    for meta in &rule.metas {
        if let Err(e) = ruleset
            .upsert_rule_metas(AlertRuleMeta {
                alert_name: rule.name.clone(),
                labels: meta.labels.clone(),
                threshold: meta.threshold,
                watch_time: None,
                updated_at: Utc::now(),
            })
            .await
        {
            log_warn(
                LogCategory::System,
                &format!("bootstrap meta for rule {} failed to persist locally: {e}", rule.name),
            );
        }
    }

    log_info(LogCategory::System, &format!("bootstrapped rule {}", rule.name));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::materializer::ThresholdMaterializer;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::io::Write;

    struct RecordingRulesetClient {
        rule_calls: Mutex<Vec<String>>,
        meta_calls: Mutex<Vec<PutRuleMetasBody>>,
    }

    #[async_trait]
    impl RulesetClient for RecordingRulesetClient {
        async fn put_alert_rule(&self, name: &str, _body: PutAlertRuleBody) -> Result<()> {
            self.rule_calls.lock().push(name.to_string());
            Ok(())
        }

        async fn put_alert_rule_metas(&self, body: PutRuleMetasBody) -> Result<()> {
            self.meta_calls.lock().push(body);
            Ok(())
        }
    }

    #[tokio::test]
    async fn bootstrap_seeds_new_rule_and_skips_existing() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        store
            .create_rule(&AlertRule {
                name: "already_there".to_string(),
                description: "d".to_string(),
                expr: "up".to_string(),
                op: ComparisonOp::Gt,
                severity: AlertLevel::P1,
                watch_time: std::time::Duration::from_secs(60),
            })
            .await
            .unwrap();

        let ruleset = Arc::new(RulesetManager::new(
            store.clone(),
            Arc::new(ThresholdMaterializer::new()),
            Arc::new(HashMap::new()),
        ));
        let ruleset_client: Arc<dyn RulesetClient> =
            Arc::new(RecordingRulesetClient { rule_calls: Mutex::new(Vec::new()), meta_calls: Mutex::new(Vec::new()) });

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"rules":[
                {{"name":"already_there","description":"d","expr":"up","op":">","severity":"P1","watch_time":60,"metas":[]}},
                {{"name":"new_rule","description":"d2","expr":"up{{}}","op":">","severity":"P0","watch_time":30,
                  "metas":[{{"labels":{{"service":"checkout","version":"v1"}},"threshold":500.0}}]}}
            ]}}"#
        )
        .unwrap();

        run(file.path().to_str().unwrap(), &store, &ruleset, &ruleset_client)
            .await
            .unwrap();

        let rules = store.fetch_all_rules().await.unwrap();
        assert_eq!(rules.len(), 2);

        let metas = store.fetch_all_metas().await.unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].alert_name, "new_rule");
    }
}
