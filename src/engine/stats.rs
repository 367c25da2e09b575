//! Pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotonic counters updated by the background pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    items_persisted: AtomicU64,
    flushes: AtomicU64,
    flush_retries: AtomicU64,
    flush_failures: AtomicU64,
    items_dropped: AtomicU64,
    conflicts_detected: AtomicU64,
    conflicts_resolved: AtomicU64,
    resolutions_failed: AtomicU64,
    detection_errors: AtomicU64,
    conflict_write_retries: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct PipelineSnapshot {
    pub items_persisted: u64,
    pub flushes: u64,
    pub flush_retries: u64,
    pub flush_failures: u64,
    pub items_dropped: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub resolutions_failed: u64,
    pub detection_errors: u64,
    pub conflict_write_retries: u64,
}

impl PipelineStats {
    /// Fresh zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_flush(&self, items: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.items_persisted.fetch_add(items as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_flush_retry(&self) {
        self.flush_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_items_dropped(&self, items: usize) {
        self.items_dropped.fetch_add(items as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_conflicts_detected(&self, n: usize) {
        self.conflicts_detected.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_resolution(&self, ok: bool) {
        if ok {
            self.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
        } else {
            self.resolutions_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_detection_error(&self) {
        self.detection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict_write_retry(&self) {
        self.conflict_write_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the current values.
    #[must_use]
    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            items_persisted: self.items_persisted.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_retries: self.flush_retries.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            items_dropped: self.items_dropped.load(Ordering::Relaxed),
            conflicts_detected: self.conflicts_detected.load(Ordering::Relaxed),
            conflicts_resolved: self.conflicts_resolved.load(Ordering::Relaxed),
            resolutions_failed: self.resolutions_failed.load(Ordering::Relaxed),
            detection_errors: self.detection_errors.load(Ordering::Relaxed),
            conflict_write_retries: self.conflict_write_retries.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = PipelineStats::new();
        stats.record_flush(3);
        stats.record_flush(2);
        stats.record_resolution(true);
        stats.record_resolution(false);
        let snap = stats.snapshot();
        assert_eq!(snap.flushes, 2);
        assert_eq!(snap.items_persisted, 5);
        assert_eq!(snap.conflicts_resolved, 1);
        assert_eq!(snap.resolutions_failed, 1);
        assert_eq!(serde_json::to_value(snap).unwrap()["itemsPersisted"], 5);
    }
}
