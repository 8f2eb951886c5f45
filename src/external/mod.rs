//! External collaborators (§6): Prometheus, the anomaly detector, and the
//! ruleset service. Each is a trait with one `reqwest`-backed production
//! implementation and a fake used by tests, so the anomaly scheduler and
//! bootstrap paths are exercised without a live HTTP endpoint.

pub mod anomaly_detector;
pub mod prometheus;
pub mod ruleset_client;

pub use anomaly_detector::{AnomalyDetectorClient, HttpAnomalyDetectorClient};
pub use prometheus::{HttpPrometheusClient, PrometheusClient};
pub use ruleset_client::{HttpRulesetClient, RulesetClient};
