//! Tiered Cache Manager
//!
//! Coordinates the memory and disk tiers:
//!
//! ```text
//!   get ──► memory ──hit──► value
//!             │ miss/expired
//!             ▼
//!           disk (worker pool) ──fresh──► promote into memory ──► value
//!             │ missing / expired / corrupt
//!             ▼
//!           None
//!
//!   set ──► memory (evict to fit) ──► schedule write-through (worker pool)
//! ```
//!
//! Disk failures never reach the caller: they are logged and counted, and
//! the lookup degrades to a miss.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::disk::{DiskRead, DiskSweep, DiskTier, DiskTierStats};
use super::entry::{estimate_size, CacheEntry, CacheValue, PersistedEntry};
use super::memory::{Lookup, MemoryTier, MemoryTierStats};
use super::metrics::{CacheMetrics, CacheMetricsSnapshot};
use super::pending::{PendingWrites, WriteOutcome};
use super::policy::EvictionStrategy;
use crate::clock::SharedClock;
use crate::context::RuntimeContext;
use crate::error::{Error, Result};
use crate::pool::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Result of one preload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreloadOutcome {
    /// A live entry already existed; the fetch was not run
    AlreadyCached,
    /// The fetch produced a value, now cached
    Loaded,
    /// The fetch produced nothing
    Empty,
    /// The fetch failed or panicked
    Failed(String),
}

type BoxedFetch<V> =
    Box<dyn FnOnce() -> BoxFuture<'static, std::result::Result<Option<V>, String>> + Send>;

/// One unit of work for [`TieredCache::batch_preload`]
pub struct PreloadItem<V> {
    key: String,
    ttl: Duration,
    fetch: BoxedFetch<V>,
}

impl<V: CacheValue> PreloadItem<V> {
    /// Wrap an async fetch for `key`
    pub fn new<F, Fut, E>(key: impl Into<String>, fetch: F, ttl: Duration) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<Option<V>, E>> + Send + 'static,
        E: std::fmt::Display,
    {
        Self {
            key: key.into(),
            ttl,
            fetch: Box::new(move || {
                async move { fetch().await.map_err(|e| e.to_string()) }.boxed()
            }),
        }
    }

    /// Key this item fills
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<V> std::fmt::Debug for PreloadItem<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreloadItem")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Summary of a batch preload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPreloadReport {
    pub loaded: usize,
    pub already_cached: usize,
    pub empty: usize,
    /// Keys whose fetch failed, with the reason
    pub failed: Vec<(String, String)>,
}

impl BatchPreloadReport {
    /// Number of items processed
    pub fn total(&self) -> usize {
        self.loaded + self.already_cached + self.empty + self.failed.len()
    }
}

/// Outcome of one expiry sweep over both tiers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired memory entries dropped
    pub memory_expired: usize,
    /// Disk directory scan
    pub disk: DiskSweep,
    /// Set when the disk scan could not run
    pub disk_error: Option<String>,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub memory: MemoryTierStats,
    pub disk: DiskTierStats,
    /// Sum of access counts of entries resident in memory
    pub total_accesses: u64,
    pub metrics: CacheMetricsSnapshot,
}

/// Two-tier cache with TTL, bounded memory and asynchronous write-through
pub struct TieredCache<V: CacheValue> {
    memory: Mutex<MemoryTier<V>>,
    disk: Arc<DiskTier>,
    strategy: EvictionStrategy,
    cleanup_interval: Duration,
    pool: WorkerPool,
    clock: SharedClock,
    metrics: Arc<CacheMetrics>,
    pending: Arc<PendingWrites<V>>,
    writes: TaskTracker,
    flush_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<Lifecycle>,
}

impl<V: CacheValue> TieredCache<V> {
    /// Build a cache from the `cache` configuration section
    ///
    /// Nothing touches the disk until [`start`](Self::start).
    pub fn new(ctx: &RuntimeContext) -> Arc<Self> {
        let settings = &ctx.config().cache;
        let strategy = settings.strategy;
        Arc::new(Self {
            memory: Mutex::new(MemoryTier::new(settings.memory_budget(), strategy.build())),
            disk: Arc::new(DiskTier::new(settings.disk_path.clone())),
            strategy,
            cleanup_interval: settings.cleanup_interval(),
            pool: ctx.pool().clone(),
            clock: Arc::clone(ctx.clock()),
            metrics: Arc::new(CacheMetrics::new()),
            pending: Arc::new(PendingWrites::new()),
            writes: TaskTracker::new(),
            flush_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
            state: Mutex::new(Lifecycle::Idle),
        })
    }

    /// Create the disk directory and launch the background sweep
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        match *self.state.lock() {
            Lifecycle::Idle => {}
            Lifecycle::Running => return Ok(()),
            Lifecycle::Stopped => return Err(Error::ShutDown("tiered cache".into())),
        }

        let disk = Arc::clone(&self.disk);
        self.pool
            .run_blocking(move || disk.ensure_dir())
            .await
            .map_err(|e| Error::Internal(format!("cache directory check: {}", e)))??;

        let mut state = self.state.lock();
        if *state != Lifecycle::Idle {
            return Ok(());
        }
        *state = Lifecycle::Running;

        let handle = tokio::spawn(sweep_loop(
            Arc::downgrade(self),
            self.shutdown.clone(),
            self.cleanup_interval,
        ));
        *self.sweeper.lock() = Some(handle);

        info!(
            disk_path = %self.disk.dir().display(),
            strategy = %self.strategy,
            budget_bytes = self.memory.lock().budget(),
            cleanup_interval_secs = self.cleanup_interval.as_secs(),
            "Tiered cache started"
        );
        Ok(())
    }

    /// Stop the sweep loop and wait for pending writes
    ///
    /// Calling it again is a no-op.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == Lifecycle::Stopped {
                return;
            }
            *state = Lifecycle::Stopped;
        }

        self.shutdown.cancel();
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Cache sweep task failed");
            }
        }
        self.flush().await;
        info!("Tiered cache stopped");
    }

    /// Look up `key` in memory, then on disk
    pub async fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let lookup = self.memory.lock().get(key, now);
        match lookup {
            Lookup::Hit(value) => {
                self.metrics.record_memory_hit();
                return Some(value);
            }
            Lookup::Expired => {
                debug!(key, "Memory entry expired");
                self.metrics.record_expirations(1);
                self.metrics.record_memory_miss();
            }
            Lookup::Miss => self.metrics.record_memory_miss(),
        }

        self.read_through(key).await
    }

    /// Store `value` under `key` and schedule its write-through
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let now = self.clock.now();
        let entry = CacheEntry::new(key, value, ttl, now);
        let persisted = entry.to_persisted();
        let size = estimate_size(&entry.value);

        let key = persisted.key.clone();
        let outcome = {
            let mut memory = self.memory.lock();
            let outcome = memory.insert(entry, size, now);
            // Staged under the memory lock so a concurrent promotion sees it
            self.pending.stage(persisted);
            outcome
        };
        if !outcome.evicted.is_empty() {
            debug!(evicted = outcome.evicted.len(), "Evicted entries from memory tier");
            self.metrics.record_evictions(outcome.evicted.len());
        }
        if !outcome.admitted {
            debug!(key = %key, size, "Entry exceeds memory budget, stored on disk only");
        }

        self.schedule_write(key);
    }

    /// Fill `key` from `fetch` unless a live entry exists
    ///
    /// Fetch errors and panics are logged and reported in the outcome.
    pub async fn preload<F, Fut, E>(&self, key: &str, fetch: F, ttl: Duration) -> PreloadOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Option<V>, E>>,
        E: std::fmt::Display,
    {
        if self.get(key).await.is_some() {
            return PreloadOutcome::AlreadyCached;
        }

        let fetched = AssertUnwindSafe(async move { fetch().await })
            .catch_unwind()
            .await;

        match fetched {
            Ok(Ok(Some(value))) => {
                self.set(key, value, ttl);
                self.metrics.record_preload_loaded();
                debug!(key, "Preloaded");
                PreloadOutcome::Loaded
            }
            Ok(Ok(None)) => {
                debug!(key, "Preload fetch returned nothing");
                PreloadOutcome::Empty
            }
            Ok(Err(e)) => {
                warn!(key, error = %e, "Preload fetch failed");
                self.metrics.record_preload_failed();
                PreloadOutcome::Failed(e.to_string())
            }
            Err(panic) => {
                let reason = crate::pool::panic_message(panic);
                warn!(key, reason = %reason, "Preload fetch panicked");
                self.metrics.record_preload_failed();
                PreloadOutcome::Failed(reason)
            }
        }
    }

    /// Run every preload concurrently and wait for all of them
    pub async fn batch_preload(&self, items: Vec<PreloadItem<V>>) -> BatchPreloadReport {
        let runs = items.into_iter().map(|item| async move {
            let PreloadItem { key, ttl, fetch } = item;
            let outcome = self.preload(&key, fetch, ttl).await;
            (key, outcome)
        });

        let mut report = BatchPreloadReport::default();
        for (key, outcome) in join_all(runs).await {
            match outcome {
                PreloadOutcome::AlreadyCached => report.already_cached += 1,
                PreloadOutcome::Loaded => report.loaded += 1,
                PreloadOutcome::Empty => report.empty += 1,
                PreloadOutcome::Failed(reason) => report.failed.push((key, reason)),
            }
        }

        info!(
            loaded = report.loaded,
            already_cached = report.already_cached,
            empty = report.empty,
            failed = report.failed.len(),
            "Batch preload finished"
        );
        report
    }

    /// Remove `key` from both tiers; `true` if either held it
    pub async fn remove(&self, key: &str) -> bool {
        let in_memory = {
            let mut memory = self.memory.lock();
            self.pending.discard(key);
            memory.remove(key).is_some()
        };
        self.flush().await;

        let disk = Arc::clone(&self.disk);
        let owned = key.to_string();
        let on_disk = match self.pool.run_blocking(move || disk.remove(&owned)).await {
            Ok(Ok(existed)) => existed,
            Ok(Err(e)) => {
                warn!(key, error = %e, "Failed to remove cache file");
                false
            }
            Err(e) => {
                warn!(key, error = %e, "Failed to remove cache file");
                false
            }
        };
        in_memory || on_disk
    }

    /// Drop every entry from both tiers
    pub async fn clear(&self) {
        {
            let mut memory = self.memory.lock();
            self.pending.clear();
            memory.clear();
        }
        self.flush().await;

        let disk = Arc::clone(&self.disk);
        match self.pool.run_blocking(move || disk.clear()).await {
            Ok(Ok(removed)) => info!(removed, "Cache cleared"),
            Ok(Err(e)) => warn!(error = %e, "Failed to clear disk tier"),
            Err(e) => warn!(error = %e, "Failed to clear disk tier"),
        }
    }

    /// Wait until every scheduled write-through has finished
    pub async fn flush(&self) {
        let _guard = self.flush_lock.lock().await;
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }

    /// Drop expired entries from both tiers now
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport {
            memory_expired: self.memory.lock().purge_expired(now),
            ..SweepReport::default()
        };
        self.metrics.record_expirations(report.memory_expired);

        let disk = Arc::clone(&self.disk);
        match self.pool.run_blocking(move || disk.sweep(now)).await {
            Ok(Ok(disk_report)) => {
                self.metrics.record_corrupt_removed(disk_report.corrupt);
                self.metrics.record_expirations(disk_report.expired);
                report.disk = disk_report;
            }
            Ok(Err(e)) => report.disk_error = Some(e.to_string()),
            Err(e) => report.disk_error = Some(e.to_string()),
        }
        report
    }

    /// Memory tier statistics without touching the disk
    pub fn memory_stats(&self) -> MemoryTierStats {
        self.memory.lock().stats(self.clock.now())
    }

    /// Statistics for both tiers
    pub async fn stats(&self) -> CacheStats {
        let memory = self.memory_stats();

        let disk_tier = Arc::clone(&self.disk);
        let disk = match self.pool.run_blocking(move || disk_tier.stats()).await {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to read disk tier stats");
                DiskTierStats::default()
            }
            Err(e) => {
                warn!(error = %e, "Failed to read disk tier stats");
                DiskTierStats::default()
            }
        };

        CacheStats {
            total_accesses: memory.total_accesses,
            memory,
            disk,
            metrics: self.metrics.snapshot(),
        }
    }

    /// Hit/miss counters
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Configured eviction strategy
    pub fn strategy(&self) -> EvictionStrategy {
        self.strategy
    }

    /// Disk tier location
    pub fn disk(&self) -> &DiskTier {
        &self.disk
    }

    /// Whether the sweep loop is running
    pub fn is_running(&self) -> bool {
        *self.state.lock() == Lifecycle::Running
    }

    async fn read_through(&self, key: &str) -> Option<V> {
        // An overwrite still on its way to disk is newer than the file
        if let Some(staged) = self.pending.latest(key) {
            return self.serve_promoted(staged, self.clock.now());
        }

        let disk = Arc::clone(&self.disk);
        let owned = key.to_string();
        let read = self
            .pool
            .run_blocking(move || disk.read::<V>(&owned))
            .await;

        let persisted = match read {
            Ok(Ok(DiskRead::Found(persisted))) => persisted,
            Ok(Ok(DiskRead::Missing)) => {
                self.metrics.record_disk_miss();
                return None;
            }
            Ok(Ok(DiskRead::Corrupt(reason))) => {
                warn!(key, reason = %reason, "Removed corrupt cache file");
                self.metrics.record_corrupt_removed(1);
                self.metrics.record_disk_miss();
                return None;
            }
            Ok(Err(e)) => {
                warn!(key, error = %e, "Disk tier read failed");
                self.metrics.record_disk_read_failure();
                self.metrics.record_disk_miss();
                return None;
            }
            Err(e) => {
                warn!(key, error = %e, "Disk tier read failed");
                self.metrics.record_disk_read_failure();
                self.metrics.record_disk_miss();
                return None;
            }
        };

        let now = self.clock.now();
        if persisted.is_expired(now) {
            if let Some(staged) = self.pending.latest(key) {
                return self.serve_promoted(staged, now);
            }
            debug!(key, "Disk entry expired");
            self.metrics.record_expirations(1);
            self.metrics.record_disk_miss();
            self.remove_file(key).await;
            return None;
        }

        self.serve_promoted(persisted, now)
    }

    fn serve_promoted(&self, persisted: PersistedEntry<V>, now: chrono::DateTime<chrono::Utc>) -> Option<V> {
        let value = self.promote(persisted, now);
        if value.is_some() {
            self.metrics.record_disk_hit();
        } else {
            self.metrics.record_expirations(1);
            self.metrics.record_disk_miss();
        }
        value
    }

    /// Install a lower-tier entry into memory and return its value
    ///
    /// `None` when the newest known version of the key has expired.
    fn promote(&self, persisted: PersistedEntry<V>, now: chrono::DateTime<chrono::Utc>) -> Option<V> {
        let mut memory = self.memory.lock();

        // A concurrent set may have stored a newer value meanwhile
        if memory.contains_live(&persisted.key, now) {
            if let Lookup::Hit(value) = memory.get(&persisted.key, now) {
                return Some(value);
            }
        }
        // or staged one too large for memory
        let persisted = self.pending.latest(&persisted.key).unwrap_or(persisted);
        if persisted.is_expired(now) {
            return None;
        }

        let mut entry = persisted.into_entry(now);
        entry.record_access(now);
        let value = entry.value.clone();
        let size = estimate_size(&value);
        let outcome = memory.insert(entry, size, now);
        drop(memory);

        self.metrics.record_evictions(outcome.evicted.len());
        if outcome.admitted {
            self.metrics.record_promotion();
        }
        Some(value)
    }

    async fn remove_file(&self, key: &str) {
        let disk = Arc::clone(&self.disk);
        let owned = key.to_string();
        match self.pool.run_blocking(move || disk.remove(&owned)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(key, error = %e, "Failed to remove cache file"),
            Err(e) => warn!(key, error = %e, "Failed to remove cache file"),
        }
    }

    fn schedule_write(&self, key: String) {
        let disk = Arc::clone(&self.disk);
        let pool = self.pool.clone();
        let metrics = Arc::clone(&self.metrics);
        let pending = Arc::clone(&self.pending);

        self.writes.spawn(async move {
            let job_key = key.clone();
            match pool
                .run_blocking(move || pending.write_latest(&job_key, &disk))
                .await
            {
                Ok(Ok(WriteOutcome::Written)) => metrics.record_disk_write(),
                Ok(Ok(WriteOutcome::Superseded)) => {}
                Ok(Err(e)) => {
                    warn!(key = %key, error = %e, "Write-through failed");
                    metrics.record_disk_write_failure();
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Write-through failed");
                    metrics.record_disk_write_failure();
                }
            }
        });
    }
}

#[instrument(skip_all, fields(interval_secs = period.as_secs()))]
async fn sweep_loop<V: CacheValue>(
    cache: Weak<TieredCache<V>>,
    shutdown: CancellationToken,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(cache) = cache.upgrade() else { break };
        let report = cache.sweep().await;
        match &report.disk_error {
            Some(e) => error!(error = %e, memory_expired = report.memory_expired, "Cache sweep failed on disk tier"),
            None => debug!(
                memory_expired = report.memory_expired,
                disk_expired = report.disk.expired,
                disk_corrupt = report.disk.corrupt,
                "Cache sweep finished"
            ),
        }
    }

    debug!("Cache sweep loop exited");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use assert_matches::assert_matches;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(dir: &Path, clock: Arc<ManualClock>, strategy: EvictionStrategy) -> RuntimeContext {
        let mut config = Config::default();
        config.cache.disk_path = dir.join("cache");
        config.cache.memory_cache_size = 1;
        config.cache.strategy = strategy;
        config.cache.cleanup_interval = 1;
        config.parallel_processing.max_workers = 2;
        RuntimeContext::with_clock(config, clock).unwrap()
    }

    async fn started(dir: &Path, clock: Arc<ManualClock>) -> Arc<TieredCache<String>> {
        let cache = TieredCache::new(&context(dir, clock, EvictionStrategy::Lru));
        cache.start().await.unwrap();
        cache
    }

    #[tokio::test]
    async fn test_set_get_memory_hit() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let cache = started(dir.path(), clock).await;

        cache.set("k", "v".to_string(), Duration::from_secs(60));
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        assert_eq!(cache.metrics().snapshot().memory_hits, 1);
        assert_eq!(cache.memory_stats().total_accesses, 1);
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_miss_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = started(dir.path(), ManualClock::starting_now()).await;
        assert_eq!(cache.get("absent").await, None);
        assert_eq!(cache.metrics().snapshot().disk_misses, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_gone_from_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let cache = started(dir.path(), Arc::clone(&clock)).await;

        cache.set("k", "v".to_string(), Duration::from_secs(60));
        cache.flush().await;
        assert!(cache.disk().path_for("k").exists());

        clock.advance(Duration::from_secs(61));
        assert_eq!(cache.get("k").await, None);
        assert!(!cache.disk().path_for("k").exists());
        assert_eq!(cache.memory_stats().entries, 0);
    }

    #[tokio::test]
    async fn test_write_through_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let first = started(dir.path(), Arc::clone(&clock)).await;
        first.set("k", "persisted".to_string(), Duration::from_secs(60));
        first.stop().await;

        let second = started(dir.path(), Arc::clone(&clock)).await;
        assert_eq!(second.get("k").await.as_deref(), Some("persisted"));
        let snap = second.metrics().snapshot();
        assert_eq!(snap.disk_hits, 1);
        assert_eq!(snap.promotions, 1);

        // Now served from memory
        assert_eq!(second.get("k").await.as_deref(), Some("persisted"));
        assert_eq!(second.metrics().snapshot().memory_hits, 1);
    }

    #[tokio::test]
    async fn test_promoted_entry_keeps_original_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let first = started(dir.path(), Arc::clone(&clock)).await;
        first.set("k", "v".to_string(), Duration::from_secs(60));
        first.stop().await;

        let second = started(dir.path(), Arc::clone(&clock)).await;
        clock.advance(Duration::from_secs(30));
        assert!(second.get("k").await.is_some());
        clock.advance(Duration::from_secs(31));
        assert_eq!(second.get("k").await, None);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_miss_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = started(dir.path(), ManualClock::starting_now()).await;
        let path = cache.disk().path_for("k");
        std::fs::write(&path, b"\x00\x01 not json").unwrap();

        assert_eq!(cache.get("k").await, None);
        assert!(!path.exists());
        assert_eq!(cache.metrics().snapshot().corrupt_removed, 1);
    }

    #[tokio::test]
    async fn test_eviction_keeps_value_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = started(dir.path(), ManualClock::starting_now()).await;
        let big = "x".repeat(400_000);

        cache.set("a", big.clone(), Duration::from_secs(60));
        cache.set("b", big.clone(), Duration::from_secs(60));
        cache.set("c", big.clone(), Duration::from_secs(60));
        cache.flush().await;

        let memory = cache.memory_stats();
        assert_eq!(memory.entries, 2);
        assert!(memory.size_bytes <= memory.capacity_bytes);
        assert_eq!(cache.metrics().snapshot().evictions, 1);

        // Evicted from memory, still answered by disk
        assert_eq!(cache.get("a").await.map(|v| v.len()), Some(400_000));
        assert_eq!(cache.metrics().snapshot().disk_hits, 1);
    }

    #[tokio::test]
    async fn test_oversized_value_goes_to_disk_only() {
        let dir = tempfile::tempdir().unwrap();
        let cache = started(dir.path(), ManualClock::starting_now()).await;
        cache.set("huge", "y".repeat(2 * 1024 * 1024), Duration::from_secs(60));
        cache.flush().await;

        assert_eq!(cache.memory_stats().entries, 0);
        assert!(cache.disk().path_for("huge").exists());
        assert!(cache.get("huge").await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_oversized_overwrite_is_never_stale() {
        let dir = tempfile::tempdir().unwrap();
        let cache = started(dir.path(), ManualClock::starting_now()).await;
        let huge = "n".repeat(2 * 1024 * 1024);

        for _ in 0..20 {
            cache.set("k", "old".to_string(), Duration::from_secs(60));
            cache.flush().await;

            // Not admitted to memory; its write-through is still pending
            cache.set("k", huge.clone(), Duration::from_secs(60));
            assert_eq!(cache.get("k").await.map(|v| v.len()), Some(huge.len()));

            cache.flush().await;
            assert_eq!(cache.get("k").await.map(|v| v.len()), Some(huge.len()));
        }
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_overwrite_of_evicted_key_reads_newest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = started(dir.path(), ManualClock::starting_now()).await;
        let big = "x".repeat(400_000);

        cache.set("a", "v1".to_string(), Duration::from_secs(60));
        cache.flush().await;
        cache.set("a", "v2".to_string(), Duration::from_secs(60));
        // Push "a" out of memory before its second write lands
        cache.set("b", big.clone(), Duration::from_secs(60));
        cache.set("c", big.clone(), Duration::from_secs(60));
        cache.set("d", big, Duration::from_secs(60));

        assert_eq!(cache.get("a").await.as_deref(), Some("v2"));
        cache.flush().await;
        assert_eq!(cache.get("a").await.as_deref(), Some("v2"));
        assert_matches!(
            cache.disk().read::<String>("a").unwrap(),
            DiskRead::Found(e) if e.value == "v2"
        );
    }

    #[tokio::test]
    async fn test_preload_fetches_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = started(dir.path(), ManualClock::starting_now()).await;
        let calls = Arc::new(AtomicUsize::new(0));

        for expected in [PreloadOutcome::Loaded, PreloadOutcome::AlreadyCached] {
            let calls = Arc::clone(&calls);
            let outcome = cache
                .preload(
                    "k",
                    || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(Some("fetched".to_string()))
                    },
                    Duration::from_secs(60),
                )
                .await;
            assert_eq!(outcome, expected);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("k").await.as_deref(), Some("fetched"));
    }

    #[tokio::test]
    async fn test_preload_failure_and_panic_are_absorbed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = started(dir.path(), ManualClock::starting_now()).await;

        let failed = cache
            .preload("a", || async { Err::<Option<String>, _>("upstream down") }, Duration::from_secs(60))
            .await;
        assert_matches!(failed, PreloadOutcome::Failed(reason) if reason == "upstream down");

        let panicked = cache
            .preload(
                "b",
                || async {
                    if true {
                        panic!("fetch exploded");
                    }
                    Ok::<Option<String>, String>(None)
                },
                Duration::from_secs(60),
            )
            .await;
        assert_matches!(panicked, PreloadOutcome::Failed(reason) if reason.contains("fetch exploded"));

        let empty = cache
            .preload("c", || async { Ok::<Option<String>, String>(None) }, Duration::from_secs(60))
            .await;
        assert_eq!(empty, PreloadOutcome::Empty);

        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("c").await, None);
        assert_eq!(cache.metrics().snapshot().preload_failed, 2);
    }

    #[tokio::test]
    async fn test_batch_preload_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let cache = started(dir.path(), ManualClock::starting_now()).await;
        cache.set("cached", "old".to_string(), Duration::from_secs(60));

        let ttl = Duration::from_secs(60);
        let items = vec![
            PreloadItem::new("one", || async { Ok::<_, String>(Some("1".to_string())) }, ttl),
            PreloadItem::new("bad", || async { Err::<Option<String>, _>("boom".to_string()) }, ttl),
            PreloadItem::new("two", || async { Ok::<_, String>(Some("2".to_string())) }, ttl),
            PreloadItem::new("cached", || async { Ok::<_, String>(Some("new".to_string())) }, ttl),
        ];
        let report = cache.batch_preload(items).await;

        assert_eq!(report.total(), 4);
        assert_eq!(report.loaded, 2);
        assert_eq!(report.already_cached, 1);
        assert_eq!(report.failed, vec![("bad".to_string(), "boom".to_string())]);
        assert_eq!(cache.get("two").await.as_deref(), Some("2"));
        assert_eq!(cache.get("cached").await.as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn test_sweep_purges_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let cache = started(dir.path(), Arc::clone(&clock)).await;
        cache.set("short", "a".to_string(), Duration::from_secs(5));
        cache.set("long", "b".to_string(), Duration::from_secs(500));
        cache.flush().await;

        clock.advance(Duration::from_secs(10));
        let report = cache.sweep().await;
        assert_eq!(report.memory_expired, 1);
        assert_eq!(report.disk.expired, 1);
        assert_eq!(report.disk_error, None);

        let stats = cache.stats().await;
        assert_eq!(stats.memory.entries, 1);
        assert_eq!(stats.disk.entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_runs_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let cache = started(dir.path(), Arc::clone(&clock)).await;
        cache.set("short", "a".to_string(), Duration::from_secs(5));
        clock.advance(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(cache.memory_stats().entries, 0);
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = started(dir.path(), ManualClock::starting_now()).await;
        cache.set("a", "1".to_string(), Duration::from_secs(60));
        cache.set("b", "2".to_string(), Duration::from_secs(60));

        assert!(cache.remove("a").await);
        assert!(!cache.remove("a").await);
        assert_eq!(cache.get("a").await, None);

        cache.clear().await;
        let stats = cache.stats().await;
        assert_eq!(stats.memory.entries, 0);
        assert_eq!(stats.disk.entries, 0);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let cache = started(dir.path(), ManualClock::starting_now()).await;
        assert!(cache.is_running());
        assert!(dir.path().join("cache").is_dir());

        cache.stop().await;
        cache.stop().await;
        assert!(!cache.is_running());
        assert_matches!(cache.start().await, Err(Error::ShutDown(_)));
    }

    #[tokio::test]
    async fn test_start_fails_on_unusable_directory() {
        let dir = tempfile::tempdir().unwrap();
        let occupied = dir.path().join("cache");
        std::fs::write(&occupied, b"not a directory").unwrap();

        let cache: Arc<TieredCache<String>> =
            TieredCache::new(&context(dir.path(), ManualClock::starting_now(), EvictionStrategy::Lru));
        assert!(cache.start().await.is_err());
        assert!(!cache.is_running());
    }
}
