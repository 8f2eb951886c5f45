//! Heal-Action Service (C7): identifies the fault domain, loads the
//! matching action recipe, and executes rollback or alert-only remediation
//! (§4.7).
//!
//! A pure function over `labels` plus a data accessor over the heal-action
//! table; execution is a switch on the action rule's `action` field. The
//! rollback collaborator is a mock (sleep, then succeed) that honors
//! cancellation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::logging::{log_info, log_warn, LogCategory};
use crate::model::{DeploymentStatus, HealActionKind, Labels};
use crate::store::StateStore;
use crate::Result;

/// Coarse classification of the failure locus (§3, §9 fault-domain label
/// keys — reads `service_name`/`version`, the same aliases §3's `canonical`
/// normalizes elsewhere, per the resolved open question).
pub const FAULT_DOMAIN_SERVICE_VERSION: &str = "service_version_issue";
pub const FAULT_DOMAIN_UNKNOWN: &str = "unknown";

/// Identify the fault domain from alert labels (§8 scenario 3): present
/// `service_name` and `version` yields `service_version_issue`; anything
/// else is `unknown`. Keys are alias-normalized first (`service_name ->
/// service`) so this agrees with `canonical()`'s label meaning (§9 open
/// question, resolved: same alias table, applied the same way).
pub fn identify_fault_domain(labels: &Labels, aliases: &std::collections::HashMap<String, String>) -> String {
    let service = crate::model::lookup_label(labels, "service", aliases);
    let version = crate::model::lookup_label(labels, "version", aliases);
    if service.is_some() && version.is_some() {
        FAULT_DOMAIN_SERVICE_VERSION.to_string()
    } else {
        FAULT_DOMAIN_UNKNOWN.to_string()
    }
}

/// Derive the deployment-status heuristic used by the mock rollback action
/// (§9 open question, resolved literally as specified): a version string
/// containing `"dev"` or `"test"` is `Deploying`, anything else `Deployed`.
/// A production implementation would consult the real deployment system.
pub fn deployment_status_from_version(version: &str) -> DeploymentStatus {
    let lower = version.to_lowercase();
    if lower.contains("dev") || lower.contains("test") {
        DeploymentStatus::Deploying
    } else {
        DeploymentStatus::Deployed
    }
}

/// Outcome of executing a heal action.
#[derive(Debug, Clone)]
pub struct HealOutcome {
    pub success: bool,
    pub message: String,
}

/// The opaque rollback collaborator. Production wiring never exists here —
/// the mock is the only implementation this core ships, per the design's
/// "rollback is an opaque black box" framing (§1).
#[async_trait]
pub trait RollbackExecutor: Send + Sync {
    async fn rollback(&self, target: Option<&str>, cancel: &CancellationToken) -> Result<HealOutcome>;
}

/// Mock rollback: sleeps for `sleep_duration`, then reports success, unless
/// cancelled first.
pub struct MockRollbackExecutor {
    pub sleep_duration: Duration,
}

#[async_trait]
impl RollbackExecutor for MockRollbackExecutor {
    async fn rollback(&self, target: Option<&str>, cancel: &CancellationToken) -> Result<HealOutcome> {
        tokio::select! {
            _ = tokio::time::sleep(self.sleep_duration) => {
                Ok(HealOutcome {
                    success: true,
                    message: format!("rollback completed for {}", target.unwrap_or("<unspecified>")),
                })
            }
            _ = cancel.cancelled() => {
                Ok(HealOutcome { success: false, message: "cancelled".to_string() })
            }
        }
    }
}

/// Loads and executes the heal action for a fault domain.
pub struct HealActionService {
    store: Arc<dyn StateStore>,
    rollback: Arc<dyn RollbackExecutor>,
    label_aliases: Arc<std::collections::HashMap<String, String>>,
}

impl HealActionService {
    pub fn new(
        store: Arc<dyn StateStore>,
        rollback: Arc<dyn RollbackExecutor>,
        label_aliases: Arc<std::collections::HashMap<String, String>>,
    ) -> Self {
        Self { store, rollback, label_aliases }
    }

    pub fn identify_fault_domain(&self, labels: &Labels) -> String {
        identify_fault_domain(labels, &self.label_aliases)
    }

    /// Execute the heal action for `fault_domain` given the alert's
    /// `version` (used only for the deployment-status heuristic). Returns
    /// `None` if the domain is `unknown` or no heal action row exists —
    /// both cases fall through to drill-down in the caller (§4.5).
    pub async fn execute(
        &self,
        fault_domain: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Option<HealOutcome> {
        if fault_domain == FAULT_DOMAIN_UNKNOWN {
            return None;
        }

        let action = match self.store.fetch_heal_action(fault_domain).await {
            Ok(action) => action,
            Err(e) => {
                log_warn(
                    LogCategory::Heal,
                    &format!("no heal action for domain {fault_domain}, falling back to drill-down: {e}"),
                );
                return None;
            }
        };

        let rules = match action.parse_rules() {
            Ok(rules) => rules,
            Err(e) => {
                log_warn(LogCategory::Heal, &format!("heal action {fault_domain} has invalid rules: {e}"));
                return None;
            }
        };

        match rules.action {
            HealActionKind::Alert => {
                log_warn(
                    LogCategory::Heal,
                    &format!("heal action for {fault_domain} is alert-only, no automatic remediation"),
                );
                Some(HealOutcome {
                    success: false,
                    message: rules.message.unwrap_or_else(|| "alert-only action".to_string()),
                })
            }
            HealActionKind::Rollback => {
                if let Some(expected) = rules.deployment_status {
                    let actual = deployment_status_from_version(version);
                    if actual != expected {
                        log_info(
                            LogCategory::Heal,
                            &format!(
                                "deployment status mismatch for {fault_domain}: expected {expected:?}, observed {actual:?}"
                            ),
                        );
                        return Some(HealOutcome {
                            success: false,
                            message: format!("deployment status mismatch: expected {expected:?}"),
                        });
                    }
                }
                match self.rollback.rollback(rules.target.as_deref(), cancel).await {
                    Ok(outcome) => Some(outcome),
                    Err(e) => Some(HealOutcome { success: false, message: e.to_string() }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HealAction;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn labels_with(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn fault_domain_requires_both_service_name_and_version() {
        let mut aliases = std::collections::HashMap::new();
        aliases.insert("service_name".to_string(), "service".to_string());
        let both = labels_with(&[("service_name", "svc-a"), ("version", "v1")]);
        assert_eq!(identify_fault_domain(&both, &aliases), FAULT_DOMAIN_SERVICE_VERSION);

        let only_version = labels_with(&[("version", "v1")]);
        assert_eq!(identify_fault_domain(&only_version, &aliases), FAULT_DOMAIN_UNKNOWN);
    }

    #[test]
    fn deployment_status_heuristic_matches_dev_and_test() {
        assert_eq!(deployment_status_from_version("v1.0.0-dev"), DeploymentStatus::Deploying);
        assert_eq!(deployment_status_from_version("v1.0.0-TEST"), DeploymentStatus::Deploying);
        assert_eq!(deployment_status_from_version("v1.0.0"), DeploymentStatus::Deployed);
    }

    #[tokio::test]
    async fn rollback_action_succeeds_when_deployment_status_matches() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_heal_action(HealAction {
            id: "h1".to_string(),
            fault_domain: FAULT_DOMAIN_SERVICE_VERSION.to_string(),
            desc: "rollback".to_string(),
            rules: json!({"action": "rollback", "deployment_status": "deployed", "target": "s3"}),
        });
        let service = HealActionService::new(
            store,
            Arc::new(MockRollbackExecutor { sleep_duration: Duration::from_millis(1) }),
            Arc::new(std::collections::HashMap::new()),
        );
        let outcome = service
            .execute(FAULT_DOMAIN_SERVICE_VERSION, "v1.0.0", &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn unknown_domain_returns_none() {
        let store = Arc::new(InMemoryStore::new());
        let service = HealActionService::new(
            store,
            Arc::new(MockRollbackExecutor { sleep_duration: Duration::from_millis(1) }),
            Arc::new(std::collections::HashMap::new()),
        );
        assert!(service
            .execute(FAULT_DOMAIN_UNKNOWN, "v1", &CancellationToken::new())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn alert_action_reports_failure_without_rollback() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_heal_action(HealAction {
            id: "h1".to_string(),
            fault_domain: FAULT_DOMAIN_SERVICE_VERSION.to_string(),
            desc: "alert only".to_string(),
            rules: json!({"action": "alert", "message": "page the on-call"}),
        });
        let service = HealActionService::new(
            store,
            Arc::new(MockRollbackExecutor { sleep_duration: Duration::from_millis(1) }),
            Arc::new(std::collections::HashMap::new()),
        );
        let outcome = service
            .execute(FAULT_DOMAIN_SERVICE_VERSION, "v1", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.message, "page the on-call");
    }
}
