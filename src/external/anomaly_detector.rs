//! Anomaly detector client (§6): `POST {anomaly_api_url}`, request
//! `{metadata:{alert_name, severity, labels}, data:[{timestamp, value}]}`,
//! response `{metadata?, anomalies:[{start, end}]}` where `start`/`end` may
//! be unix-second number/string or an RFC3339 string — both are accepted.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{AlertLevel, Labels};
use crate::{ControlPlaneError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct AnomalyRequestMetadata {
    pub alert_name: String,
    pub severity: AlertLevel,
    pub labels: Labels,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnomalyDataPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnomalyDetectionRequest {
    pub metadata: AnomalyRequestMetadata,
    pub data: Vec<AnomalyDataPoint>,
}

/// A detected anomaly window, decoded from whichever of the three accepted
/// timestamp shapes the detector used.
#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AnomalyDetectionResponse {
    pub anomalies: Vec<Anomaly>,
}

#[async_trait]
pub trait AnomalyDetectorClient: Send + Sync {
    async fn detect(&self, request: AnomalyDetectionRequest) -> Result<AnomalyDetectionResponse>;
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[allow(dead_code)]
    metadata: Option<Value>,
    anomalies: Vec<RawAnomaly>,
}

#[derive(Debug, Deserialize)]
struct RawAnomaly {
    start: Value,
    end: Value,
}

fn parse_tolerant_timestamp(v: &Value) -> Result<DateTime<Utc>> {
    match v {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            s.parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                .ok_or_else(|| ControlPlaneError::Invalid(format!("unparseable anomaly timestamp {s:?}")))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .ok_or_else(|| ControlPlaneError::Invalid(format!("unparseable anomaly timestamp {n}"))),
        other => Err(ControlPlaneError::Invalid(format!(
            "unexpected anomaly timestamp shape: {other}"
        ))),
    }
}

/// `reqwest`-backed [`AnomalyDetectorClient`].
pub struct HttpAnomalyDetectorClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpAnomalyDetectorClient {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self { client: reqwest::Client::new(), url, timeout }
    }
}

#[async_trait]
impl AnomalyDetectorClient for HttpAnomalyDetectorClient {
    async fn detect(&self, request: AnomalyDetectionRequest) -> Result<AnomalyDetectionResponse> {
        let raw = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json::<RawResponse>()
            .await?;

        let anomalies = raw
            .anomalies
            .iter()
            .map(|a| {
                Ok(Anomaly {
                    start: parse_tolerant_timestamp(&a.start)?,
                    end: parse_tolerant_timestamp(&a.end)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(AnomalyDetectionResponse { anomalies })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_and_unix_second_shapes() {
        let rfc3339 = parse_tolerant_timestamp(&Value::from("1970-01-01T00:00:10Z")).unwrap();
        assert_eq!(rfc3339.timestamp(), 10);

        let numeric = parse_tolerant_timestamp(&Value::from(20)).unwrap();
        assert_eq!(numeric.timestamp(), 20);

        let stringy_numeric = parse_tolerant_timestamp(&Value::from("30")).unwrap();
        assert_eq!(stringy_numeric.timestamp(), 30);
    }
}
