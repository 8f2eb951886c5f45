//! Anomaly Scheduler (C8): builds PromQL from rules and metas, runs
//! per-series anomaly detection, de-duplicates against open alerts, and
//! adaptively tunes thresholds (§4.8).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::PrometheusSchedulerConfig;
use crate::external::anomaly_detector::{
    AnomalyDataPoint, AnomalyDetectionRequest, AnomalyDetectorClient, AnomalyRequestMetadata,
};
use crate::external::prometheus::PrometheusClient;
use crate::external::ruleset_client::{MetaPutEntry, PutRuleMetasBody, RulesetClient};
use crate::logging::{log_error, log_info, log_warn, LogCategory};
use crate::materializer::ThresholdMaterializer;
use crate::model::{canonical, lookup_label, AlertIssue, AlertRuleMeta, ChangeType, Labels};
use crate::monitoring;
use crate::store::{synthesize_change_log, StateStore};
use crate::Result;

const THRESHOLD_ADJUSTMENT_FACTOR: f64 = 0.99;
const THRESHOLD_EPSILON: f64 = 1e-9;

/// One rule/meta pairing resolved into a concrete PromQL query (§4.8 step 2).
#[derive(Clone)]
struct QueryJob {
    alert_name: String,
    expr: String,
    labels: Labels,
    threshold: f64,
    severity: crate::model::AlertLevel,
}

/// Periodically tunes alert-rule thresholds from observed Prometheus series
/// and the anomaly-detection collaborator's output.
pub struct AnomalyScheduler {
    store: Arc<dyn StateStore>,
    prometheus: Arc<dyn PrometheusClient>,
    detector: Arc<dyn AnomalyDetectorClient>,
    ruleset_client: Arc<dyn RulesetClient>,
    materializer: Arc<ThresholdMaterializer>,
    label_aliases: Arc<HashMap<String, String>>,
    config: PrometheusSchedulerConfig,
}

impl AnomalyScheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        prometheus: Arc<dyn PrometheusClient>,
        detector: Arc<dyn AnomalyDetectorClient>,
        ruleset_client: Arc<dyn RulesetClient>,
        materializer: Arc<ThresholdMaterializer>,
        label_aliases: Arc<HashMap<String, String>>,
        config: PrometheusSchedulerConfig,
    ) -> Self {
        Self { store, prometheus, detector, ruleset_client, materializer, label_aliases, config }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log_info(LogCategory::AnomalyScheduler, "cancelled");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        log_error(LogCategory::AnomalyScheduler, "tick failed", &e);
                    }
                }
            }
        }
    }

    /// Build the PromQL query set by joining rules to metas on
    /// `rule.name = meta.alert_name` (§4.8 step 1-2).
    fn build_query_set(&self, rules: &[crate::model::AlertRule], metas: &[AlertRuleMeta]) -> Vec<QueryJob> {
        let rules_by_name: HashMap<&str, &crate::model::AlertRule> =
            rules.iter().map(|r| (r.name.as_str(), r)).collect();
        metas
            .iter()
            .filter_map(|meta| {
                let rule = rules_by_name.get(meta.alert_name.as_str())?;
                Some(QueryJob {
                    alert_name: meta.alert_name.clone(),
                    expr: substitute_labels(&rule.expr, &meta.labels),
                    labels: meta.labels.clone(),
                    threshold: meta.threshold,
                    severity: rule.severity,
                })
            })
            .collect()
    }

    /// Run one full tick at `now` (injected so tests are deterministic).
    ///
    /// Queries are fetched one rule/meta job at a time (each is a single
    /// Prometheus call, honoring the ≤30s timeout), but the resulting
    /// per-series anomaly-detection calls fan out concurrently over a
    /// `FuturesUnordered`, bounded by a `Semaphore` so a tick with many
    /// series doesn't open unbounded concurrent requests to the detector.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        let rules = self.store.fetch_all_rules().await?;
        let metas = self.store.fetch_all_metas().await?;
        let jobs = self.build_query_set(&rules, &metas);

        let non_terminal = self.store.fetch_non_terminal_alerts().await?;
        monitoring::record_tick("anomaly", jobs.len());

        let start = now - chrono::Duration::from_std(self.config.query_range).unwrap_or_default();

        let mut series_jobs = Vec::new();
        for job in jobs {
            let series = match self
                .prometheus
                .query_range(&job.expr, start, now, self.config.query_step, self.config.query_timeout)
                .await
            {
                Ok(series) => series,
                Err(e) => {
                    log_warn(
                        LogCategory::AnomalyScheduler,
                        &format!("query_range failed for {}: {e}", job.alert_name),
                    );
                    continue;
                }
            };
            for s in series {
                series_jobs.push((job.clone(), s.metric, s.samples));
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_series.max(1)));
        let mut in_flight = FuturesUnordered::new();
        for (job, metric, samples) in &series_jobs {
            let semaphore = semaphore.clone();
            in_flight.push(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let result = self.process_series(job, metric, samples, &non_terminal).await;
                (job.alert_name.as_str(), result)
            });
        }

        while let Some((alert_name, result)) = in_flight.next().await {
            if let Err(e) = result {
                log_warn(
                    LogCategory::AnomalyScheduler,
                    &format!("series processing failed for {alert_name}: {e}"),
                );
            }
        }
        Ok(())
    }

    async fn process_series(
        &self,
        job: &QueryJob,
        metric: &Labels,
        samples: &[(DateTime<Utc>, f64)],
        non_terminal: &[AlertIssue],
    ) -> Result<()> {
        let data = samples
            .iter()
            .map(|(ts, v)| AnomalyDataPoint { timestamp: *ts, value: *v })
            .collect();

        let request = AnomalyDetectionRequest {
            metadata: AnomalyRequestMetadata {
                alert_name: job.alert_name.clone(),
                severity: job.severity,
                labels: metric.clone(),
            },
            data,
        };

        let response = self.detector.detect(request).await?;

        let service = lookup_label(metric, "service", &self.label_aliases);
        let version = lookup_label(metric, "version", &self.label_aliases);

        for anomaly in response.anomalies {
            if overlaps_any_open_alert(&anomaly.start, &anomaly.end, non_terminal) {
                continue;
            }

            let (Some(service), Some(version)) = (service.clone(), version.clone()) else {
                continue;
            };

            self.adjust_threshold(&job.alert_name, &service, &version).await?;
        }
        Ok(())
    }

    /// Steps 7-11: recompute and, if materially changed, push a new
    /// threshold for `(alert_name, service, version)`.
    async fn adjust_threshold(&self, alert_name: &str, service: &str, version: &str) -> Result<()> {
        let mut target_labels = Labels::new();
        target_labels.insert("service".to_string(), service.to_string());
        target_labels.insert("version".to_string(), version.to_string());
        let target_key = canonical(&target_labels, &self.label_aliases);

        let exact = match self.store.fetch_meta_exact(alert_name, &target_key).await {
            Ok(meta) => meta,
            Err(_) => return Ok(()),
        };

        let new_threshold = exact.threshold * THRESHOLD_ADJUSTMENT_FACTOR;
        if (new_threshold - exact.threshold).abs() <= THRESHOLD_EPSILON {
            return Ok(());
        }

        let siblings: Vec<AlertRuleMeta> = self
            .store
            .fetch_metas_by_service(service)
            .await?
            .into_iter()
            .filter(|m| m.alert_name == alert_name)
            .collect();

        let entries: Vec<MetaPutEntry> = siblings
            .iter()
            .map(|m| {
                let key = canonical(&m.labels, &self.label_aliases);
                let threshold = if key == target_key { new_threshold } else { m.threshold };
                MetaPutEntry {
                    labels: serde_json::to_string(&m.labels).unwrap_or_default(),
                    threshold,
                }
            })
            .collect();

        let body = PutRuleMetasBody { rule_name: alert_name.to_string(), metas: entries };

        if let Err(e) = self.ruleset_client.put_alert_rule_metas(body).await {
            log_warn(
                LogCategory::AnomalyScheduler,
                &format!("ruleset sync failed for {alert_name}/{target_key}, not logging: {e}"),
            );
            return Ok(());
        }

        let now = Utc::now();
        let mut updated = exact.clone();
        updated.threshold = new_threshold;
        updated.updated_at = now;

        self.materializer.sync_meta(alert_name, &target_key, new_threshold, updated.watch_time);

        let log = synthesize_change_log(
            alert_name,
            ChangeType::Update,
            updated.labels.clone(),
            Some(exact.threshold),
            Some(new_threshold),
            exact.watch_time,
            updated.watch_time,
            now,
        );
        self.store.upsert_meta_and_log(&updated, &target_key, log).await?;
        monitoring::record_threshold_adjustment(alert_name);
        log_info(
            LogCategory::AnomalyScheduler,
            &format!("threshold for {alert_name}/{target_key} adjusted {} -> {new_threshold}", exact.threshold),
        );
        Ok(())
    }
}

/// Substitute a rule's `{}` placeholder with `k="v"` pairs, comma-joined in
/// lexicographic key order (§4.8 step 2, order-insensitive per the design).
fn substitute_labels(expr: &str, labels: &Labels) -> String {
    let rendered = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect::<Vec<_>>()
        .join(",");
    expr.replace("{}", &format!("{{{rendered}}}"))
}

/// §4.8 step 6 / §9 resolved: strict-inside overlap, scoped to alerts whose
/// window genuinely brackets the anomaly. Resolved boundary semantics: an
/// anomaly starting exactly at `alert_since` is NOT suppressed (strict `>`
/// as written, not `>=`).
fn overlaps_any_open_alert(anomaly_start: &DateTime<Utc>, anomaly_end: &DateTime<Utc>, alerts: &[AlertIssue]) -> bool {
    alerts.iter().any(|alert| match alert.resolved_at {
        Some(resolved_at) => *anomaly_start > alert.alert_since && *anomaly_end < resolved_at,
        None => *anomaly_start > alert.alert_since,
    })
}
