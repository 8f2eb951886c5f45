//! Lightweight production metrics surface: counters and gauges for each
//! subsystem's hot path, plus a DashMap-backed suppression window so a
//! condition that recurs every tick against the same row doesn't spam the
//! logs.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::{counter, gauge};

/// Tracks the last time `(subsystem, key)` was allowed to log, so repeated
/// occurrences against the same row/series within `window` emit once.
pub struct NoiseSuppressor {
    last_seen: DashMap<(&'static str, String), Instant>,
    window: Duration,
}

impl NoiseSuppressor {
    pub fn new(window: Duration) -> Self {
        Self { last_seen: DashMap::new(), window }
    }

    /// First call for a given key within `window` returns `true`; every
    /// repeat until the window elapses returns `false`.
    pub fn should_log(&self, subsystem: &'static str, key: &str) -> bool {
        let now = Instant::now();
        let entry_key = (subsystem, key.to_string());
        let mut allow = true;
        self.last_seen
            .entry(entry_key)
            .and_modify(|last| {
                if now.duration_since(*last) < self.window {
                    allow = false;
                } else {
                    *last = now;
                }
            })
            .or_insert(now);
        allow
    }
}

/// Record one scheduler tick and the number of rows it touched.
pub fn record_tick(subsystem: &'static str, batch_size: usize) {
    counter!("alert_control_plane_ticks_total", 1, "subsystem" => subsystem);
    gauge!("alert_control_plane_tick_batch_size", batch_size as f64, "subsystem" => subsystem);
}

/// Record a lost CAS race (benign, but worth tracking contention).
pub fn record_cas_conflict(subsystem: &'static str) {
    counter!("alert_control_plane_cas_conflicts_total", 1, "subsystem" => subsystem);
}

/// Record a heal action outcome.
pub fn record_heal_outcome(success: bool) {
    counter!("alert_control_plane_heal_outcomes_total", 1, "success" => success.to_string());
}

/// Record an alert bus publish attempt; `rejected` when the bus was full.
pub fn record_bus_publish(rejected: bool) {
    if rejected {
        counter!("alert_control_plane_bus_publish_rejected_total", 1);
    } else {
        counter!("alert_control_plane_bus_publish_total", 1);
    }
}

/// Record a threshold self-tuning adjustment actually applied.
pub fn record_threshold_adjustment(alert_name: &str) {
    counter!("alert_control_plane_threshold_adjustments_total", 1, "alert_name" => alert_name.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppressor_allows_once_then_suppresses_until_window_elapses() {
        let suppressor = NoiseSuppressor::new(Duration::from_millis(20));
        assert!(suppressor.should_log("pending", "alert-1"));
        assert!(!suppressor.should_log("pending", "alert-1"));
        std::thread::sleep(Duration::from_millis(25));
        assert!(suppressor.should_log("pending", "alert-1"));
    }

    #[test]
    fn suppressor_tracks_keys_independently() {
        let suppressor = NoiseSuppressor::new(Duration::from_secs(60));
        assert!(suppressor.should_log("pending", "alert-1"));
        assert!(suppressor.should_log("pending", "alert-2"));
    }
}
