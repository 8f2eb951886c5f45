//! Ruleset service client (§6): `PUT /v1/alert-rules/{name}` and
//! `PUT /v1/alert-rule-metas/{rule_name}`. HTTP 2xx is success; 4xx/5xx is a
//! hard failure (no change log written by the caller).

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::model::{AlertLevel, ComparisonOp};
use crate::Result;

#[derive(Debug, Clone, Serialize)]
pub struct PutAlertRuleBody {
    pub description: String,
    pub expr: String,
    pub op: ComparisonOp,
    pub severity: AlertLevel,
    pub watch_time: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetaPutEntry {
    /// Canonical JSON string of the label set (§6).
    pub labels: String,
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PutRuleMetasBody {
    pub rule_name: String,
    pub metas: Vec<MetaPutEntry>,
}

#[async_trait]
pub trait RulesetClient: Send + Sync {
    /// `PUT /v1/alert-rules/{name}` (bootstrap only; §6).
    async fn put_alert_rule(&self, name: &str, body: PutAlertRuleBody) -> Result<()>;

    /// `PUT /v1/alert-rule-metas/{rule_name}` — used by both the anomaly
    /// scheduler (§4.8 step 11) and bootstrap (§6), which share the same
    /// canonical meta-sync contract.
    async fn put_alert_rule_metas(&self, body: PutRuleMetasBody) -> Result<()>;
}

/// `reqwest`-backed [`RulesetClient`].
pub struct HttpRulesetClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpRulesetClient {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        Self { client: reqwest::Client::new(), base_url, timeout }
    }
}

#[async_trait]
impl RulesetClient for HttpRulesetClient {
    async fn put_alert_rule(&self, name: &str, body: PutAlertRuleBody) -> Result<()> {
        self.client
            .put(format!("{}/v1/alert-rules/{name}", self.base_url))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn put_alert_rule_metas(&self, body: PutRuleMetasBody) -> Result<()> {
        self.client
            .put(format!("{}/v1/alert-rule-metas/{}", self.base_url, body.rule_name))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
