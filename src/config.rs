//! Configuration surface.
//!
//! Recognized options only — this mirrors the design's configuration table
//! exactly; anything not listed there is not a supported key. Layering is:
//! built-in defaults, then an optional config file, then environment
//! variables prefixed `ACP_` (double underscore as the nesting separator,
//! e.g. `ACP_SCHEDULER__PENDING__BATCH=500`), via the `config` crate.
//! `.env` is loaded first (if present) with `dotenvy` so environment
//! variables can be supplied that way in local development.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::{ControlPlaneError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PendingSchedulerConfig {
    #[serde(with = "humantime_serde_secs")]
    pub interval: Duration,
    pub batch: usize,
    pub workers: usize,
    pub alert_chan_size: usize,
}

impl Default for PendingSchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            batch: 200,
            workers: 1,
            alert_chan_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrometheusSchedulerConfig {
    #[serde(with = "humantime_serde_secs")]
    pub interval: Duration,
    #[serde(with = "humantime_serde_secs")]
    pub query_step: Duration,
    #[serde(with = "humantime_serde_secs")]
    pub query_range: Duration,
    #[serde(with = "humantime_serde_secs")]
    pub query_timeout: Duration,
    /// Bound on concurrent per-series anomaly-detection calls within a
    /// single tick (§4.8's bounded fan-out).
    pub max_concurrent_series: usize,
}

impl Default for PrometheusSchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            query_step: Duration::from_secs(60),
            query_range: Duration::from_secs(6 * 60 * 60),
            query_timeout: Duration::from_secs(30),
            max_concurrent_series: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub pending: PendingSchedulerConfig,
    pub prometheus: PrometheusSchedulerConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pending: PendingSchedulerConfig::default(),
            prometheus: PrometheusSchedulerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnomalyClientConfig {
    pub url: String,
    #[serde(with = "humantime_serde_secs")]
    pub timeout: Duration,
}

impl Default for AnomalyClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RulesetClientConfig {
    pub base_url: String,
    #[serde(with = "humantime_serde_secs")]
    pub timeout: Duration,
}

impl Default for RulesetClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrometheusClientConfig {
    pub url: String,
}

impl Default for PrometheusClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExternalConfig {
    pub anomaly: AnomalyClientConfig,
    pub ruleset: RulesetClientConfig,
    pub prometheus: PrometheusClientConfig,
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            anomaly: AnomalyClientConfig::default(),
            ruleset: RulesetClientConfig::default(),
            prometheus: PrometheusClientConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemediationConfig {
    #[serde(with = "humantime_serde_secs")]
    pub rollback_sleep: Duration,
    #[serde(with = "humantime_serde_secs")]
    pub observation_duration: Duration,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            rollback_sleep: Duration::from_secs(30),
            observation_duration: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisCacheConfig {
    pub addr: String,
    pub password: Option<String>,
    pub db: i64,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            addr: "redis://127.0.0.1:6379".to_string(),
            password: None,
            db: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresStoreConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub sslmode: String,
}

impl Default for PostgresStoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            dbname: "alert_control_plane".to_string(),
            sslmode: "disable".to_string(),
        }
    }
}

impl PostgresStoreConfig {
    /// Render as a libpq-style connection string for `sqlx::PgPool`.
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.user, self.password, self.host, self.port, self.dbname, self.sslmode
        )
    }
}

/// Label alias table used by both `model::canonical` and fault-domain
/// identification, so the two paths agree on label meaning (§9).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LabelConfig {
    pub aliases: HashMap<String, String>,
}

impl Default for LabelConfig {
    fn default() -> Self {
        let mut aliases = HashMap::new();
        aliases.insert("service_version".to_string(), "version".to_string());
        aliases.insert("service_name".to_string(), "service".to_string());
        Self { aliases }
    }
}

/// Root configuration, assembled from defaults, an optional file, and
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub external: ExternalConfig,
    pub remediation: RemediationConfig,
    pub cache: RedisCacheConfig,
    pub store: PostgresStoreConfig,
    pub labels: LabelConfig,
    pub bootstrap_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            external: ExternalConfig::default(),
            remediation: RemediationConfig::default(),
            cache: RedisCacheConfig::default(),
            store: PostgresStoreConfig::default(),
            labels: LabelConfig::default(),
            bootstrap_file: None,
        }
    }
}

impl Config {
    /// Load configuration from (in increasing precedence) built-in defaults,
    /// an optional `config.toml` in the current directory, and `ACP_`-prefixed
    /// environment variables.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("ACP")
                    .separator("__")
                    .try_parsing(true),
            );

        let raw = builder
            .build()
            .map_err(|e| ControlPlaneError::Invalid(format!("config: {e}")))?;

        // `config::Config::try_deserialize` only fills in keys that are
        // present; start from our own defaults so unset keys keep them.
        let mut cfg = Config::default();
        if let Ok(partial) = raw.try_deserialize::<Config>() {
            cfg = partial;
        }
        Ok(cfg)
    }
}

/// Serde (de)serialization of a `Duration` as whole seconds, matching the
/// design's "durations are expressed in whole seconds when crossing
/// boundaries" rule.
mod humantime_serde_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_design_table() {
        let cfg = Config::default();
        assert_eq!(cfg.scheduler.pending.interval, Duration::from_secs(10));
        assert_eq!(cfg.scheduler.pending.batch, 200);
        assert_eq!(cfg.scheduler.pending.workers, 1);
        assert_eq!(cfg.scheduler.pending.alert_chan_size, 1024);
        assert_eq!(cfg.scheduler.prometheus.interval, Duration::from_secs(300));
        assert_eq!(cfg.scheduler.prometheus.query_step, Duration::from_secs(60));
        assert_eq!(cfg.scheduler.prometheus.query_range, Duration::from_secs(21600));
        assert_eq!(cfg.external.anomaly.timeout, Duration::from_secs(10));
        assert_eq!(cfg.external.ruleset.timeout, Duration::from_secs(10));
        assert_eq!(cfg.scheduler.prometheus.query_timeout, Duration::from_secs(30));
        assert_eq!(cfg.remediation.rollback_sleep, Duration::from_secs(30));
        assert_eq!(cfg.remediation.observation_duration, Duration::from_secs(1800));
    }

    #[test]
    fn label_aliases_cover_both_directions() {
        let cfg = LabelConfig::default();
        assert_eq!(cfg.aliases.get("service_version").unwrap(), "version");
        assert_eq!(cfg.aliases.get("service_name").unwrap(), "service");
    }
}
