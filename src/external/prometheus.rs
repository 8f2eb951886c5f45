//! Prometheus `query_range` client (§6): `GET /api/v1/query_range`, response
//! `{status, data:{resultType, result:[{metric, values:[[unixSeconds,
//! "value"]...]}]}}`. Values may be strings or numbers; both are accepted.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::model::Labels;
use crate::{ControlPlaneError, Result};

/// One time series returned by a `query_range` call, with its samples
/// decoded to `(timestamp, value)` pairs.
#[derive(Debug, Clone)]
pub struct PromSeries {
    pub metric: Labels,
    pub samples: Vec<(DateTime<Utc>, f64)>,
}

#[async_trait]
pub trait PrometheusClient: Send + Sync {
    /// Execute `query_range` over `[start, end]` at `step`, bounded by
    /// `timeout` (§4.8 step 3).
    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
        timeout: Duration,
    ) -> Result<Vec<PromSeries>>;
}

#[derive(Debug, Deserialize)]
struct QueryRangeResponse {
    status: String,
    data: Option<QueryRangeData>,
}

#[derive(Debug, Deserialize)]
struct QueryRangeData {
    result: Vec<QueryRangeResult>,
}

#[derive(Debug, Deserialize)]
struct QueryRangeResult {
    metric: Labels,
    values: Vec<(i64, Value)>,
}

fn parse_tolerant_value(v: &Value) -> Result<f64> {
    match v {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ControlPlaneError::Invalid(format!("non-finite prometheus value: {n}"))),
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|e| ControlPlaneError::Invalid(format!("unparseable prometheus value {s:?}: {e}"))),
        other => Err(ControlPlaneError::Invalid(format!(
            "unexpected prometheus value shape: {other}"
        ))),
    }
}

/// `reqwest`-backed [`PrometheusClient`].
pub struct HttpPrometheusClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPrometheusClient {
    pub fn new(base_url: String) -> Self {
        Self { client: reqwest::Client::new(), base_url }
    }
}

#[async_trait]
impl PrometheusClient for HttpPrometheusClient {
    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
        timeout: Duration,
    ) -> Result<Vec<PromSeries>> {
        let response = self
            .client
            .get(format!("{}/api/v1/query_range", self.base_url))
            .query(&[
                ("query", query.to_string()),
                ("start", start.timestamp().to_string()),
                ("end", end.timestamp().to_string()),
                ("step", step.as_secs().to_string()),
            ])
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<QueryRangeResponse>()
            .await?;

        if response.status != "success" {
            return Err(ControlPlaneError::Unavailable(format!(
                "prometheus query_range status={}",
                response.status
            )));
        }

        let data = response
            .data
            .ok_or_else(|| ControlPlaneError::Invalid("prometheus response missing data".to_string()))?;

        data.result
            .into_iter()
            .map(|r| {
                let samples = r
                    .values
                    .iter()
                    .map(|(ts, v)| {
                        let value = parse_tolerant_value(v)?;
                        let timestamp = DateTime::<Utc>::from_timestamp(*ts, 0)
                            .ok_or_else(|| ControlPlaneError::Invalid(format!("bad timestamp {ts}")))?;
                        Ok((timestamp, value))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(PromSeries { metric: r.metric, samples })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_string_and_numeric_values() {
        assert_eq!(parse_tolerant_value(&Value::from("1.5")).unwrap(), 1.5);
        assert_eq!(parse_tolerant_value(&Value::from(2.5)).unwrap(), 2.5);
    }
}
