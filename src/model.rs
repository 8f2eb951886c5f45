//! Core data model (§3) plus the pure functions that operate on it:
//! label canonicalization, the idempotency-key derivation, and the
//! service-health derivation rule.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label map. Keys are unique by construction (it's a map); values may be
/// empty strings, which canonicalization drops.
pub type Labels = BTreeMap<String, String>;

/// Alert severity. `P0` drives automated healing; `P1`/`P2` drive drill-down
/// analysis only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertLevel {
    P0,
    P1,
    P2,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::P0 => write!(f, "P0"),
            AlertLevel::P1 => write!(f, "P1"),
            AlertLevel::P2 => write!(f, "P2"),
        }
    }
}

/// Alert lifecycle position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertState {
    Pending,
    InProcessing,
    Restored,
}

/// Whether an alert still requires attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertStatus {
    Open,
    Closed,
}

/// Derived service health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    Normal,
    Warning,
    Error,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Normal => write!(f, "Normal"),
            HealthState::Warning => write!(f, "Warning"),
            HealthState::Error => write!(f, "Error"),
        }
    }
}

/// Derive the service-health target for a newly observed alert level.
/// `P0 -> Error`, `{P1, P2} -> Warning`, anything else -> `Warning`.
pub fn derive_health_state(level: AlertLevel) -> HealthState {
    match level {
        AlertLevel::P0 => HealthState::Error,
        AlertLevel::P1 | AlertLevel::P2 => HealthState::Warning,
    }
}

/// Durable alert-issue record (§3 "Alert Issue").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertIssue {
    pub id: String,
    pub level: AlertLevel,
    pub title: String,
    pub labels: Labels,
    pub alert_since: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub alert_state: AlertState,
    pub state: AlertStatus,
}

impl AlertIssue {
    pub fn service(&self) -> Option<&str> {
        self.labels.get("service").map(|s| s.as_str())
    }

    /// `alert_state = Restored` implies `state = Closed`; callers that flip
    /// `alert_state` to `Restored` must flip `state` in the same write.
    pub fn mark_restored(&mut self, now: DateTime<Utc>) {
        self.alert_state = AlertState::Restored;
        self.state = AlertStatus::Closed;
        if self.resolved_at.is_none() {
            self.resolved_at = Some(now);
        }
    }
}

/// Durable service-health record, keyed by `(service, version)` (§3
/// "Service State").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceState {
    pub service: String,
    pub version: String,
    pub health_state: HealthState,
    pub report_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub alert_issue_ids: Vec<String>,
}

/// Alert rule registry entry (§3 "Alert Rule").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub description: String,
    /// PromQL left-hand side with a `{}` placeholder for label injection.
    pub expr: String,
    pub op: ComparisonOp,
    pub severity: AlertLevel,
    pub watch_time: std::time::Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

/// A label-scoped threshold override for a rule (§3 "Alert Rule Meta").
/// Identity is `(alert_name, canonical(labels))`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleMeta {
    pub alert_name: String,
    pub labels: Labels,
    pub threshold: f64,
    pub watch_time: Option<std::time::Duration>,
    pub updated_at: DateTime<Utc>,
}

impl AlertRuleMeta {
    pub fn canonical_key(&self, aliases: &std::collections::HashMap<String, String>) -> String {
        canonical(&self.labels, aliases)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Create,
    Update,
    Delete,
    Rollback,
}

/// Append-only audit record of a threshold/watch-time modification
/// (§3 "Change Log").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLog {
    pub id: String,
    pub alert_name: String,
    pub change_type: ChangeType,
    pub labels: Labels,
    pub old_threshold: Option<f64>,
    pub new_threshold: Option<f64>,
    pub old_watch: Option<std::time::Duration>,
    pub new_watch: Option<std::time::Duration>,
    pub change_time: DateTime<Utc>,
}

/// Recognized fields inside a `HealAction.rules` JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealActionRules {
    pub action: HealActionKind,
    pub deployment_status: Option<DeploymentStatus>,
    pub target: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealActionKind {
    Rollback,
    Alert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Deploying,
    Deployed,
}

/// A fault-domain-specific remediation recipe (§3 "Heal Action").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealAction {
    pub id: String,
    #[serde(rename = "type")]
    pub fault_domain: String,
    pub desc: String,
    pub rules: serde_json::Value,
}

impl HealAction {
    pub fn parse_rules(&self) -> crate::Result<HealActionRules> {
        serde_json::from_value(self.rules.clone())
            .map_err(|e| crate::ControlPlaneError::Invalid(format!("heal action rules: {e}")))
    }
}

/// Time-bounded per-service "quiet verification" window (§3 "Observation
/// Window"). At most one active window per `(service, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationWindow {
    pub service: String,
    pub version: String,
    pub alert_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: std::time::Duration,
    pub is_active: bool,
}

impl ObservationWindow {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_time
    }
}

/// Bus payload carried from the pending scheduler to the remediation
/// consumer (§3 "Alert Message").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertMessage {
    pub id: String,
    pub service: String,
    pub version: String,
    pub level: AlertLevel,
    pub title: String,
    pub alert_since: DateTime<Utc>,
    pub labels: Labels,
}

/// Apply the alias table to a single label key (`service_version -> version`,
/// `service_name -> service`, …), so canonicalization and fault-domain
/// identification agree on label meaning (§9).
pub fn normalize_key(
    key: &str,
    aliases: &std::collections::HashMap<String, String>,
) -> String {
    let lower = key.trim().to_lowercase();
    aliases.get(&lower).cloned().unwrap_or(lower)
}

/// Look up `canonical_key` in `labels` after alias-normalizing every label
/// key, returning the first non-empty match. Used everywhere a component
/// needs `service`/`version` out of a raw label map with the same alias
/// meaning `canonical()` uses (§9 fault-domain label keys, resolved).
pub fn lookup_label(
    labels: &Labels,
    canonical_key: &str,
    aliases: &std::collections::HashMap<String, String>,
) -> Option<String> {
    labels.iter().find_map(|(k, v)| {
        let trimmed = v.trim();
        (normalize_key(k, aliases) == canonical_key && !trimmed.is_empty())
            .then(|| trimmed.to_string())
    })
}

/// Sort keys lexicographically and join `k=v|...` over a lowercase, trimmed,
/// alias-normalized label set with empty values removed (§3).
///
/// `canonical({" Service ": " s3 ", "service_version": " V1 ", "empty": "  "})`
/// with alias `{service_version -> version}` = `"service=s3|version=V1"`.
pub fn canonical(labels: &Labels, aliases: &std::collections::HashMap<String, String>) -> String {
    let mut normalized: BTreeMap<String, String> = BTreeMap::new();
    for (k, v) in labels {
        let value = v.trim().to_string();
        if value.is_empty() {
            continue;
        }
        let key = normalize_key(k, aliases);
        normalized.insert(key, value);
    }
    normalized
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("|")
}

/// Derive an external idempotency key from the fields an (out-of-scope)
/// ingestion layer would use to de-duplicate a firing event before ever
/// writing a `Pending` row.
///
/// `idempotency_key("test-service", "v1.0.0", starts_at, "firing")` where
/// `starts_at = 1970-01-01T00:00:00.000000123Z` yields
/// `"test-service|v1.0.0|1970-01-01T00:00:00.000000123Z|firing"`.
pub fn idempotency_key(
    service: &str,
    service_version: &str,
    starts_at: DateTime<Utc>,
    status: &str,
) -> String {
    format!(
        "{}|{}|{}|{}",
        service,
        service_version,
        starts_at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        status
    )
}

/// Parse a raw `labels` JSON blob tolerating both the `{k: v, ...}` object
/// shape and the `[{key, value}, ...]` array-of-pairs shape (§4.4 step 2).
/// Any other shape yields an empty label set rather than an error, since a
/// malformed label blob must not stall the pending scheduler's tick.
pub fn parse_labels_tolerant(raw: &serde_json::Value) -> Labels {
    match raw {
        serde_json::Value::Object(map) => map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect(),
        serde_json::Value::Array(entries) => entries
            .iter()
            .filter_map(|entry| {
                let key = entry.get("key")?.as_str()?;
                let value = entry.get("value")?.as_str()?;
                Some((key.to_string(), value.to_string()))
            })
            .collect(),
        _ => Labels::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[test]
    fn canonical_label_key_scenario() {
        let mut labels = Labels::new();
        labels.insert(" Service ".to_string(), " s3 ".to_string());
        labels.insert("service_version".to_string(), " V1 ".to_string());
        labels.insert("empty".to_string(), "  ".to_string());

        let mut aliases = HashMap::new();
        aliases.insert("service_version".to_string(), "version".to_string());

        assert_eq!(canonical(&labels, &aliases), "service=s3|version=V1");
    }

    #[test]
    fn canonical_is_order_invariant() {
        let aliases = HashMap::new();
        let mut a = Labels::new();
        a.insert("a".to_string(), "1".to_string());
        a.insert("b".to_string(), "2".to_string());

        let mut b = Labels::new();
        b.insert("b".to_string(), "2".to_string());
        b.insert("a".to_string(), "1".to_string());

        assert_eq!(canonical(&a, &aliases), canonical(&b, &aliases));
    }

    #[test]
    fn idempotency_key_derivation_scenario() {
        let starts_at = DateTime::<Utc>::from_timestamp(0, 123).unwrap();
        let key = idempotency_key("test-service", "v1.0.0", starts_at, "firing");
        assert_eq!(
            key,
            "test-service|v1.0.0|1970-01-01T00:00:00.000000123Z|firing"
        );
    }

    #[test]
    fn health_derivation_matches_severity_table() {
        assert_eq!(derive_health_state(AlertLevel::P0), HealthState::Error);
        assert_eq!(derive_health_state(AlertLevel::P1), HealthState::Warning);
        assert_eq!(derive_health_state(AlertLevel::P2), HealthState::Warning);
    }

    #[test]
    fn mark_restored_closes_and_sets_resolved_at_once() {
        let mut labels = Labels::new();
        labels.insert("service".to_string(), "s3".to_string());
        let mut issue = AlertIssue {
            id: "a1".to_string(),
            level: AlertLevel::P0,
            title: "t".to_string(),
            labels,
            alert_since: Utc::now(),
            resolved_at: None,
            alert_state: AlertState::InProcessing,
            state: AlertStatus::Open,
        };
        let first = Utc::now();
        issue.mark_restored(first);
        let first_resolved = issue.resolved_at.unwrap();

        // A second call must not clear/replace resolved_at.
        issue.mark_restored(Utc::now());
        assert_eq!(issue.resolved_at.unwrap(), first_resolved);
        assert_eq!(issue.alert_state, AlertState::Restored);
        assert_eq!(issue.state, AlertStatus::Closed);
    }

    #[test]
    fn parse_labels_tolerant_accepts_object_shape() {
        let raw = serde_json::json!({"service": "s3", "version": "v1"});
        let labels = parse_labels_tolerant(&raw);
        assert_eq!(labels.get("service").unwrap(), "s3");
        assert_eq!(labels.get("version").unwrap(), "v1");
    }

    #[test]
    fn parse_labels_tolerant_accepts_array_of_pairs_shape() {
        let raw = serde_json::json!([{"key": "service", "value": "s3"}]);
        let labels = parse_labels_tolerant(&raw);
        assert_eq!(labels.get("service").unwrap(), "s3");
    }

    proptest! {
        #[test]
        fn canonical_is_insensitive_to_label_insertion_order(
            a_key in "[a-z]{1,8}", a_val in "[a-zA-Z0-9]{1,8}",
            b_key in "[a-z]{1,8}", b_val in "[a-zA-Z0-9]{1,8}",
        ) {
            prop_assume!(a_key != b_key);
            let mut forward = Labels::new();
            forward.insert(a_key.clone(), a_val.clone());
            forward.insert(b_key.clone(), b_val.clone());

            let mut backward = Labels::new();
            backward.insert(b_key, b_val);
            backward.insert(a_key, a_val);

            prop_assert_eq!(canonical(&forward, &HashMap::new()), canonical(&backward, &HashMap::new()));
        }

        #[test]
        fn idempotency_key_round_trips_its_four_fields(
            service in "[a-z0-9-]{1,12}",
            version in "[a-z0-9.]{1,12}",
            status in "firing|resolved",
        ) {
            let starts_at = Utc::now();
            let key = idempotency_key(&service, &version, starts_at, &status);
            let parts: Vec<&str> = key.splitn(4, '|').collect();
            prop_assert_eq!(parts[0], service.as_str());
            prop_assert_eq!(parts[1], version.as_str());
            prop_assert_eq!(parts[3], status.as_str());
        }
    }
}
