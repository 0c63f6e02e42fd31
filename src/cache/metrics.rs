//! Cache Metrics Collection
//!
//! Lock-free counters for hit/miss accounting, read by
//! [`TieredCache::stats`](super::TieredCache::stats) and the telemetry
//! exporter.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Memory tier
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,

    // Disk tier
    disk_hits: AtomicU64,
    disk_misses: AtomicU64,
    promotions: AtomicU64,
    corrupt_removed: AtomicU64,
    disk_read_failures: AtomicU64,
    disk_writes: AtomicU64,
    disk_write_failures: AtomicU64,

    // Preload
    preload_loaded: AtomicU64,
    preload_failed: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_miss(&self) {
        self.memory_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_expirations(&self, count: usize) {
        self.expirations.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_disk_hit(&self) {
        self.disk_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_miss(&self) {
        self.disk_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt_removed(&self, count: usize) {
        self.corrupt_removed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_disk_read_failure(&self) {
        self.disk_read_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_write(&self) {
        self.disk_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_write_failure(&self) {
        self.disk_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preload_loaded(&self) {
        self.preload_loaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preload_failed(&self) {
        self.preload_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Fraction of `get` calls answered by either tier
    pub fn hit_ratio(&self) -> f64 {
        let hits = (self.memory_hits.load(Ordering::Relaxed)
            + self.disk_hits.load(Ordering::Relaxed)) as f64;
        let misses = self.disk_misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get a snapshot of all counters
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            memory_misses: self.memory_misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            disk_misses: self.disk_misses.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            corrupt_removed: self.corrupt_removed.load(Ordering::Relaxed),
            disk_read_failures: self.disk_read_failures.load(Ordering::Relaxed),
            disk_writes: self.disk_writes.load(Ordering::Relaxed),
            disk_write_failures: self.disk_write_failures.load(Ordering::Relaxed),
            preload_loaded: self.preload_loaded.load(Ordering::Relaxed),
            preload_failed: self.preload_failed.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.memory_hits,
            &self.memory_misses,
            &self.evictions,
            &self.expirations,
            &self.disk_hits,
            &self.disk_misses,
            &self.promotions,
            &self.corrupt_removed,
            &self.disk_read_failures,
            &self.disk_writes,
            &self.disk_write_failures,
            &self.preload_loaded,
            &self.preload_failed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time snapshot of [`CacheMetrics`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheMetricsSnapshot {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub disk_hits: u64,
    pub disk_misses: u64,
    pub promotions: u64,
    pub corrupt_removed: u64,
    pub disk_read_failures: u64,
    pub disk_writes: u64,
    pub disk_write_failures: u64,
    pub preload_loaded: u64,
    pub preload_failed: u64,
    pub hit_ratio: f64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hit_ratio(), 0.0);

        metrics.record_memory_hit();
        metrics.record_memory_hit();
        metrics.record_memory_miss();
        metrics.record_disk_hit();
        metrics.record_memory_miss();
        metrics.record_disk_miss();

        // 3 answered, 1 missed both tiers
        assert!((metrics.hit_ratio() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let metrics = CacheMetrics::new();
        metrics.record_evictions(3);
        metrics.record_corrupt_removed(2);
        metrics.record_disk_write();

        let snap = metrics.snapshot();
        assert_eq!(snap.evictions, 3);
        assert_eq!(snap.corrupt_removed, 2);
        assert_eq!(snap.disk_writes, 1);

        metrics.reset();
        assert_eq!(metrics.snapshot(), CacheMetricsSnapshot::default());
    }
}
