//! Prometheus Telemetry
//!
//! Gauges mirroring the component stats, kept in a registry owned by the
//! runtime rather than the process-wide default one. The health supervisor
//! refreshes them on every pass; `/metrics` only encodes.

use std::collections::BTreeMap;

use prometheus::{Encoder, Gauge, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::CacheStats;
use crate::error::Result;
use crate::monitor::SourceStatusSnapshot;
use crate::processor::ProcessorStats;

const NAMESPACE: &str = "sourcekeeper";

/// Registry plus every gauge the runtime exports
#[derive(Clone)]
pub struct Telemetry {
    registry: Registry,

    cache_memory_bytes: IntGauge,
    cache_memory_capacity_bytes: IntGauge,
    cache_memory_entries: IntGauge,
    cache_memory_utilization: Gauge,
    cache_disk_bytes: IntGauge,
    cache_disk_entries: IntGauge,
    cache_hits: IntGaugeVec,
    cache_misses: IntGaugeVec,
    cache_evictions: IntGauge,
    cache_hit_ratio: Gauge,

    source_status: IntGaugeVec,
    source_error_rate: GaugeVec,
    source_avg_response_seconds: GaugeVec,
    source_samples: IntGaugeVec,

    processor_active_tasks: IntGauge,
    pool_busy_workers: IntGauge,
    pool_max_workers: IntGauge,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

impl Telemetry {
    /// Create and register every gauge
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let cache_memory_bytes = IntGauge::with_opts(opts(
            "cache_memory_bytes",
            "Estimated bytes held by the memory tier",
        ))?;
        let cache_memory_capacity_bytes = IntGauge::with_opts(opts(
            "cache_memory_capacity_bytes",
            "Byte budget of the memory tier",
        ))?;
        let cache_memory_entries = IntGauge::with_opts(opts(
            "cache_memory_entries",
            "Entries resident in the memory tier",
        ))?;
        let cache_memory_utilization = Gauge::with_opts(opts(
            "cache_memory_utilization",
            "Memory tier size divided by its budget",
        ))?;
        let cache_disk_bytes =
            IntGauge::with_opts(opts("cache_disk_bytes", "Bytes of cache files on disk"))?;
        let cache_disk_entries =
            IntGauge::with_opts(opts("cache_disk_entries", "Cache files on disk"))?;
        let cache_hits = IntGaugeVec::new(opts("cache_hits", "Cache hits by tier"), &["tier"])?;
        let cache_misses =
            IntGaugeVec::new(opts("cache_misses", "Cache misses by tier"), &["tier"])?;
        let cache_evictions = IntGauge::with_opts(opts(
            "cache_evictions",
            "Entries evicted from the memory tier",
        ))?;
        let cache_hit_ratio = Gauge::with_opts(opts(
            "cache_hit_ratio",
            "Hits over lookups across both tiers",
        ))?;

        let source_status = IntGaugeVec::new(
            opts(
                "source_status",
                "Source status (0=unknown, 1=healthy, 2=degraded, 3=reconnecting)",
            ),
            &["source"],
        )?;
        let source_error_rate = GaugeVec::new(
            opts("source_error_rate", "Error rate over the retained window"),
            &["source"],
        )?;
        let source_avg_response_seconds = GaugeVec::new(
            opts(
                "source_avg_response_seconds",
                "Mean response time over the retained window",
            ),
            &["source"],
        )?;
        let source_samples = IntGaugeVec::new(
            opts("source_samples", "Samples in the retained window"),
            &["source"],
        )?;

        let processor_active_tasks = IntGauge::with_opts(opts(
            "processor_active_tasks",
            "Tasks currently tracked by the batch processor",
        ))?;
        let pool_busy_workers = IntGauge::with_opts(opts(
            "pool_busy_workers",
            "Worker pool permits in use",
        ))?;
        let pool_max_workers =
            IntGauge::with_opts(opts("pool_max_workers", "Worker pool size"))?;

        registry.register(Box::new(cache_memory_bytes.clone()))?;
        registry.register(Box::new(cache_memory_capacity_bytes.clone()))?;
        registry.register(Box::new(cache_memory_entries.clone()))?;
        registry.register(Box::new(cache_memory_utilization.clone()))?;
        registry.register(Box::new(cache_disk_bytes.clone()))?;
        registry.register(Box::new(cache_disk_entries.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(cache_evictions.clone()))?;
        registry.register(Box::new(cache_hit_ratio.clone()))?;
        registry.register(Box::new(source_status.clone()))?;
        registry.register(Box::new(source_error_rate.clone()))?;
        registry.register(Box::new(source_avg_response_seconds.clone()))?;
        registry.register(Box::new(source_samples.clone()))?;
        registry.register(Box::new(processor_active_tasks.clone()))?;
        registry.register(Box::new(pool_busy_workers.clone()))?;
        registry.register(Box::new(pool_max_workers.clone()))?;

        Ok(Self {
            registry,
            cache_memory_bytes,
            cache_memory_capacity_bytes,
            cache_memory_entries,
            cache_memory_utilization,
            cache_disk_bytes,
            cache_disk_entries,
            cache_hits,
            cache_misses,
            cache_evictions,
            cache_hit_ratio,
            source_status,
            source_error_rate,
            source_avg_response_seconds,
            source_samples,
            processor_active_tasks,
            pool_busy_workers,
            pool_max_workers,
        })
    }

    pub fn observe_cache(&self, stats: &CacheStats) {
        self.cache_memory_bytes.set(clamp_i64(stats.memory.size_bytes));
        self.cache_memory_capacity_bytes
            .set(clamp_i64(stats.memory.capacity_bytes));
        self.cache_memory_entries
            .set(clamp_i64(stats.memory.entries as u64));
        self.cache_memory_utilization.set(stats.memory.utilization);
        self.cache_disk_bytes.set(clamp_i64(stats.disk.size_bytes));
        self.cache_disk_entries.set(clamp_i64(stats.disk.entries as u64));

        let m = &stats.metrics;
        self.cache_hits
            .with_label_values(&["memory"])
            .set(clamp_i64(m.memory_hits));
        self.cache_hits
            .with_label_values(&["disk"])
            .set(clamp_i64(m.disk_hits));
        self.cache_misses
            .with_label_values(&["memory"])
            .set(clamp_i64(m.memory_misses));
        self.cache_misses
            .with_label_values(&["disk"])
            .set(clamp_i64(m.disk_misses));
        self.cache_evictions.set(clamp_i64(m.evictions));
        self.cache_hit_ratio.set(m.hit_ratio);
    }

    pub fn observe_sources(&self, sources: &BTreeMap<String, SourceStatusSnapshot>) {
        for (name, snap) in sources {
            let labels = [name.as_str()];
            self.source_status
                .with_label_values(&labels)
                .set(snap.status.code());
            self.source_error_rate
                .with_label_values(&labels)
                .set(snap.error_rate);
            self.source_avg_response_seconds
                .with_label_values(&labels)
                .set(snap.avg_response_time.map_or(0.0, |d| d.as_secs_f64()));
            self.source_samples
                .with_label_values(&labels)
                .set(clamp_i64(snap.sample_count as u64));
        }
    }

    pub fn observe_processor(&self, stats: &ProcessorStats) {
        self.processor_active_tasks
            .set(clamp_i64(stats.active_tasks as u64));
        self.pool_busy_workers
            .set(clamp_i64(stats.pool.busy_workers as u64));
        self.pool_max_workers
            .set(clamp_i64(stats.pool.max_workers as u64));
    }

    /// Encode the registry in the text exposition format
    ///
    /// Returns the content type together with the body.
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("families", &self.registry.gather().len())
            .finish()
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

// =============================================================================
// Tests
// =============================================================================
