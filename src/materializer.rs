//! Threshold Materializer (C10): an in-memory, process-wide mapping
//! `(rule, canonical(labels)) -> {threshold, watch_time}` for live consumers
//! such as the Prometheus rule adapter (§4.10).
//!
//! Intentionally not the source of truth — it is rebuilt from the store on
//! startup and is consistent only within a single `sync_meta` completion
//! (§4.9). Guarded by a reader/writer lock, not a transactional store.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;

/// A materialized threshold/watch pair for one `(rule, canonical-labels)` key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterializedThreshold {
    pub threshold: f64,
    pub watch_time: Option<Duration>,
}

fn key(rule: &str, canonical_labels: &str) -> String {
    format!("{rule}|{canonical_labels}")
}

/// In-memory threshold materializer.
#[derive(Default)]
pub struct ThresholdMaterializer {
    entries: RwLock<HashMap<String, MaterializedThreshold>>,
}

impl ThresholdMaterializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or overwrite) the rule's default-threshold placeholder. Ruleset
    /// creation does not carry a threshold by itself — thresholds arrive via
    /// [`Self::sync_meta`] — so this only ensures the rule's namespace
    /// exists; it never fails.
    pub fn add_rule(&self, _rule: &str) {}

    /// Remove every entry whose key is prefixed `{rule}|` (§4.9
    /// `DeleteAlertRule`).
    pub fn delete_rule(&self, rule: &str) {
        let prefix = format!("{rule}|");
        self.entries.write().retain(|k, _| !k.starts_with(&prefix));
    }

    /// Upsert the threshold/watch pair for `(rule, canonical_labels)`.
    pub fn sync_meta(
        &self,
        rule: &str,
        canonical_labels: &str,
        threshold: f64,
        watch_time: Option<Duration>,
    ) {
        self.entries.write().insert(
            key(rule, canonical_labels),
            MaterializedThreshold { threshold, watch_time },
        );
    }

    /// Current value for `(rule, canonical_labels)`, if materialized.
    pub fn get(&self, rule: &str, canonical_labels: &str) -> Option<MaterializedThreshold> {
        self.entries.read().get(&key(rule, canonical_labels)).copied()
    }

    /// Every materialized entry for `rule`, keyed by canonical labels.
    pub fn entries_for_rule(&self, rule: &str) -> HashMap<String, MaterializedThreshold> {
        let prefix = format!("{rule}|");
        self.entries
            .read()
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|labels| (labels.to_string(), *v)))
            .collect()
    }

    /// Rebuild from scratch, e.g. on startup reconciliation against the
    /// store.
    pub fn rebuild(&self, entries: impl IntoIterator<Item = (String, String, MaterializedThreshold)>) {
        let mut guard = self.entries.write();
        guard.clear();
        for (rule, canonical_labels, value) in entries {
            guard.insert(key(&rule, &canonical_labels), value);
        }
    }
}
