//! Cache metrics
//!
//! Lock-free counters recorded by the facade on every operation. A
//! [`MetricsSnapshot`] is embedded in the status blob.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// =============================================================================
// Counters
// =============================================================================

/// Operation counters for one cache
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    failed_writes: AtomicU64,
    deletes: AtomicU64,
    lock_acquisitions: AtomicU64,
    lock_contentions: AtomicU64,
    tag_invalidations: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a write outcome
    pub fn record_write(&self, ok: bool) {
        if ok {
            self.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_deletes(&self, count: u64) {
        self.deletes.fetch_add(count, Ordering::Relaxed);
    }

    /// Record the outcome of a lock acquisition
    pub fn record_lock(&self, acquired: bool) {
        if acquired {
            self.lock_acquisitions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.lock_contentions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_tag_invalidation(&self) {
        self.tag_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            lock_acquisitions: self.lock_acquisitions.load(Ordering::Relaxed),
            lock_contentions: self.lock_contentions.load(Ordering::Relaxed),
            tag_invalidations: self.tag_invalidations.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Copy of [`CacheMetrics`] at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub failed_writes: u64,
    pub deletes: u64,
    pub lock_acquisitions: u64,
    pub lock_contentions: u64,
    pub tag_invalidations: u64,
}

impl MetricsSnapshot {
    /// Hits over total reads, `0.0` before the first read
    pub fn hit_ratio(&self) -> f64 {
        let reads = self.hits + self.misses;
        if reads == 0 {
            0.0
        } else {
            self.hits as f64 / reads as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
        assert_eq!(metrics.snapshot().hit_ratio(), 0.0);
    }

    #[test]
    fn test_hit_ratio() {
        let metrics = CacheMetrics::new();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        let snap = metrics.snapshot();
        assert_eq!(snap.hits, 3);
        assert_eq!(snap.misses, 1);
        assert!((snap.hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_write_and_lock_outcomes_split() {
        let metrics = CacheMetrics::new();
        metrics.record_write(true);
        metrics.record_write(false);
        metrics.record_lock(true);
        metrics.record_lock(false);
        metrics.record_lock(false);
        let snap = metrics.snapshot();
        assert_eq!(snap.writes, 1);
        assert_eq!(snap.failed_writes, 1);
        assert_eq!(snap.lock_acquisitions, 1);
        assert_eq!(snap.lock_contentions, 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = CacheMetrics::new();
        metrics.record_tag_invalidation();
        let value = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(value["tag_invalidations"], 1);
    }
}
