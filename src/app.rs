//! Composition root: wires the store, cache, bus, and external clients into
//! the four concurrent subsystems (§5) and runs them to completion.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bus;
use crate::cache::{HotStateCache, RedisCache};
use crate::config::Config;
use crate::external::anomaly_detector::{AnomalyDetectorClient, HttpAnomalyDetectorClient};
use crate::external::prometheus::{HttpPrometheusClient, PrometheusClient};
use crate::external::ruleset_client::{HttpRulesetClient, RulesetClient};
use crate::heal::{HealActionService, MockRollbackExecutor};
use crate::logging::{log_error, log_info, log_warn, LogCategory};
use crate::materializer::ThresholdMaterializer;
use crate::observation::ObservationWindowManager;
use crate::remediation::RemediationConsumer;
use crate::ruleset::RulesetManager;
use crate::scheduler::{AnomalyScheduler, PendingScheduler};
use crate::store::{PostgresStore, StateStore};
use crate::{bootstrap, Result};

/// Fully wired application. Each field is a shared handle used by one or
/// more of the four background tasks spawned from [`App::run`].
pub struct App {
    pub store: Arc<dyn StateStore>,
    pub cache: Arc<dyn HotStateCache>,
    pub ruleset: Arc<RulesetManager>,
    pending: Arc<PendingScheduler>,
    remediation: Arc<RemediationConsumer>,
    anomaly: Arc<AnomalyScheduler>,
    bus_rx: std::sync::Mutex<Option<bus::AlertBusReceiver>>,
}

impl App {
    /// Connect to the store and cache, construct every collaborator, and
    /// run bootstrap if `config.bootstrap_file` is set.
    pub async fn build(config: Config) -> Result<Self> {
        let store: Arc<dyn StateStore> = Arc::new(PostgresStore::connect(&config.store).await?);
        let cache: Arc<dyn HotStateCache> = Arc::new(RedisCache::connect(&config.cache).await?);
        let label_aliases = Arc::new(config.labels.aliases.clone());
        let materializer = Arc::new(ThresholdMaterializer::new());

        let (bus_tx, bus_rx) = bus::channel(config.scheduler.pending.alert_chan_size);

        let pending = Arc::new(PendingScheduler::new(
            store.clone(),
            cache.clone(),
            bus_tx,
            config.scheduler.pending.clone(),
            label_aliases.clone(),
        ));

        let rollback = Arc::new(MockRollbackExecutor { sleep_duration: config.remediation.rollback_sleep });
        let heal = Arc::new(HealActionService::new(store.clone(), rollback, label_aliases.clone()));
        let observation = Arc::new(ObservationWindowManager::new(cache.clone()));
        let remediation = Arc::new(RemediationConsumer::new(
            store.clone(),
            cache.clone(),
            observation,
            heal,
            config.remediation.observation_duration,
        ));

        let ruleset = Arc::new(RulesetManager::new(store.clone(), materializer.clone(), label_aliases.clone()));

        let prometheus_client: Arc<dyn PrometheusClient> =
            Arc::new(HttpPrometheusClient::new(config.external.prometheus.url.clone()));
        let detector_client: Arc<dyn AnomalyDetectorClient> = Arc::new(HttpAnomalyDetectorClient::new(
            config.external.anomaly.url.clone(),
            config.external.anomaly.timeout,
        ));
        let ruleset_client: Arc<dyn RulesetClient> = Arc::new(HttpRulesetClient::new(
            config.external.ruleset.base_url.clone(),
            config.external.ruleset.timeout,
        ));

        let anomaly = Arc::new(AnomalyScheduler::new(
            store.clone(),
            prometheus_client,
            detector_client,
            ruleset_client.clone(),
            materializer.clone(),
            label_aliases.clone(),
            config.scheduler.prometheus.clone(),
        ));

        if let Some(path) = &config.bootstrap_file {
            if let Err(e) = bootstrap::run(path, &store, &ruleset, &ruleset_client).await {
                log_warn(LogCategory::System, &format!("bootstrap from {path} failed: {e}"));
            }
        }

        Ok(Self {
            store,
            cache,
            ruleset,
            pending,
            remediation,
            anomaly,
            bus_rx: std::sync::Mutex::new(Some(bus_rx)),
        })
    }

    /// Spawn the three background tickers (T1 pending, T2 remediation, T3
    /// anomaly) bound to `cancel`, and await all of them. T4 (the ruleset
    /// manager) serves synchronous calls directly off `self.ruleset` and
    /// has no loop of its own.
    pub async fn run(&self, cancel: CancellationToken) {
        let bus_rx = self
            .bus_rx
            .lock()
            .expect("bus receiver mutex poisoned")
            .take()
            .expect("App::run called more than once");

        let pending = self.pending.clone();
        let pending_cancel = cancel.clone();
        let pending_handle = tokio::spawn(async move { pending.run(pending_cancel).await });

        let remediation = self.remediation.clone();
        let remediation_cancel = cancel.clone();
        let remediation_handle =
            tokio::spawn(async move { remediation.run(bus_rx, remediation_cancel).await });

        let anomaly = self.anomaly.clone();
        let anomaly_cancel = cancel.clone();
        let anomaly_handle = tokio::spawn(async move { anomaly.run(anomaly_cancel).await });

        log_info(LogCategory::System, "all subsystems started");

        let (pending_res, remediation_res, anomaly_res) =
            tokio::join!(pending_handle, remediation_handle, anomaly_handle);

        for (name, res) in [
            ("pending_scheduler", pending_res),
            ("remediation_consumer", remediation_res),
            ("anomaly_scheduler", anomaly_res),
        ] {
            if let Err(e) = res {
                log_error(LogCategory::System, &format!("{name} task panicked"), &e);
            }
        }
    }
}
