//! Observation-Window Manager (C6): time-bounded per-service "quiet
//! verification" windows following a healing action (§4.6).
//!
//! A thin wrapper over [`crate::cache::HotStateCache`]'s observation
//! primitives — this module owns the logging and duration bookkeeping the
//! cache layer itself stays silent about.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::cache::HotStateCache;
use crate::logging::{log_info, LogCategory};
use crate::model::ObservationWindow;
use crate::Result;

/// Manages at-most-one-active-window-per-identity verification periods.
pub struct ObservationWindowManager {
    cache: Arc<dyn HotStateCache>,
}

impl ObservationWindowManager {
    pub fn new(cache: Arc<dyn HotStateCache>) -> Self {
        Self { cache }
    }

    /// `StartObservation(service, version, alert_id, duration)`.
    pub async fn start(
        &self,
        service: &str,
        version: &str,
        alert_id: &str,
        duration: Duration,
    ) -> Result<()> {
        let now = Utc::now();
        let window = ObservationWindow {
            service: service.to_string(),
            version: version.to_string(),
            alert_id: alert_id.to_string(),
            start_time: now,
            end_time: now + chrono::Duration::from_std(duration).unwrap_or_default(),
            duration,
            is_active: true,
        };
        self.cache.start_observation(window).await?;
        log_info(
            LogCategory::Observation,
            &format!("observation window started for {service}:{version} alert={alert_id}"),
        );
        Ok(())
    }

    /// `CheckObservation(service, version)`.
    pub async fn check(&self, service: &str, version: &str) -> Result<Option<ObservationWindow>> {
        self.cache.check_observation(service, version).await
    }

    /// `CompleteObservation(service, version)`.
    pub async fn complete(&self, service: &str, version: &str) -> Result<ObservationWindow> {
        let window = self.cache.complete_observation(service, version).await?;
        log_info(
            LogCategory::Observation,
            &format!("observation window completed for {service}:{version}"),
        );
        Ok(window)
    }

    /// `CancelObservation(service, version)`.
    pub async fn cancel(&self, service: &str, version: &str) -> Result<()> {
        self.cache.cancel_observation(service, version).await?;
        log_info(
            LogCategory::Observation,
            &format!("observation window cancelled for {service}:{version}"),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;

    #[tokio::test]
    async fn start_then_complete_leaves_window_absent() {
        let mgr = ObservationWindowManager::new(Arc::new(InMemoryCache::new()));
        mgr.start("s3", "v1", "alert-1", Duration::from_secs(1800)).await.unwrap();
        assert!(mgr.check("s3", "v1").await.unwrap().is_some());

        mgr.complete("s3", "v1").await.unwrap();
        assert!(mgr.check("s3", "v1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn start_then_cancel_leaves_window_absent() {
        let mgr = ObservationWindowManager::new(Arc::new(InMemoryCache::new()));
        mgr.start("s3", "v1", "alert-1", Duration::from_secs(1800)).await.unwrap();
        mgr.cancel("s3", "v1").await.unwrap();
        assert!(mgr.check("s3", "v1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_without_start_is_not_found() {
        let mgr = ObservationWindowManager::new(Arc::new(InMemoryCache::new()));
        let err = mgr.complete("s3", "v1").await.unwrap_err();
        assert!(matches!(err, crate::ControlPlaneError::NotFound(_)));
    }

    #[tokio::test]
    async fn cancel_without_start_is_a_no_op() {
        let mgr = ObservationWindowManager::new(Arc::new(InMemoryCache::new()));
        mgr.cancel("s3", "v1").await.unwrap();
    }
}
