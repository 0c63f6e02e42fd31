//! Component Runtime
//!
//! Owns the shared context and the three components, starts them in
//! dependency order and tears them down in reverse. A supervisor task
//! periodically inspects all of them, logs what looks wrong and refreshes
//! the Prometheus gauges.
//!
//! ```text
//! start:     monitor ──► cache ──► processor ──► supervisor
//! shutdown:  supervisor ──► processor ──► cache ──► monitor ──► pool
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheValue, TieredCache};
use crate::clock::SharedClock;
use crate::config::Config;
use crate::context::RuntimeContext;
use crate::error::{Error, Result};
use crate::monitor::{SourceHealthMonitor, SourceStatus};
use crate::processor::ParallelBatchProcessor;
use crate::telemetry::Telemetry;

/// Memory tier utilization above which the supervisor warns
pub const CACHE_UTILIZATION_WARN: f64 = 0.9;

/// Active tasks above `max_workers` times this factor trigger a warning
pub const ACTIVE_TASK_WARN_FACTOR: usize = 2;

/// Default supervisor period
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Outcome of one supervisor pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    /// Sources currently degraded or reconnecting
    pub unhealthy_sources: Vec<String>,
    pub cache_utilization: f64,
    pub active_tasks: usize,
    pub warnings: Vec<String>,
}

impl HealthReport {
    /// No warnings were raised
    pub fn is_healthy(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Handles shared between the runtime and its supervisor task
struct Supervisor<V: CacheValue> {
    cache: Arc<TieredCache<V>>,
    monitor: Arc<SourceHealthMonitor>,
    processor: Arc<ParallelBatchProcessor>,
    telemetry: Telemetry,
    clock: SharedClock,
    last_report: Arc<Mutex<Option<HealthReport>>>,
}

impl<V: CacheValue> Clone for Supervisor<V> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            monitor: Arc::clone(&self.monitor),
            processor: Arc::clone(&self.processor),
            telemetry: self.telemetry.clone(),
            clock: Arc::clone(&self.clock),
            last_report: Arc::clone(&self.last_report),
        }
    }
}

impl<V: CacheValue> Supervisor<V> {
    async fn check(&self) -> HealthReport {
        let sources = self.monitor.all_source_status();
        let cache = self.cache.stats().await;
        let processor = self.processor.stats();

        let mut warnings = Vec::new();
        let mut unhealthy_sources = Vec::new();
        for (name, snap) in &sources {
            match snap.status {
                SourceStatus::Healthy => {}
                SourceStatus::Unknown => debug!(source = %name, "Source has no health data yet"),
                SourceStatus::Degraded | SourceStatus::Reconnecting => {
                    warn!(
                        source = %name,
                        status = %snap.status,
                        error_rate = snap.error_rate,
                        last_error = snap.last_error.as_deref().unwrap_or(""),
                        "Source unhealthy"
                    );
                    warnings.push(format!("source {} is {}", name, snap.status));
                    unhealthy_sources.push(name.clone());
                }
            }
        }

        let utilization = cache.memory.utilization;
        if utilization > CACHE_UTILIZATION_WARN {
            warn!(
                utilization,
                size_bytes = cache.memory.size_bytes,
                capacity_bytes = cache.memory.capacity_bytes,
                "Memory cache nearly full"
            );
            warnings.push(format!("cache utilization {:.2}", utilization));
        }

        let task_limit = processor.pool.max_workers * ACTIVE_TASK_WARN_FACTOR;
        if processor.active_tasks > task_limit {
            warn!(
                active_tasks = processor.active_tasks,
                limit = task_limit,
                "Batch processor backlog"
            );
            warnings.push(format!("{} active tasks", processor.active_tasks));
        }

        self.telemetry.observe_sources(&sources);
        self.telemetry.observe_cache(&cache);
        self.telemetry.observe_processor(&processor);

        let report = HealthReport {
            checked_at: self.clock.now(),
            unhealthy_sources,
            cache_utilization: utilization,
            active_tasks: processor.active_tasks,
            warnings,
        };
        *self.last_report.lock() = Some(report.clone());
        report
    }

    #[instrument(name = "health_supervisor", skip_all)]
    async fn run(self, shutdown: CancellationToken, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        // interval fires immediately; the start-up pass already ran
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.check().await;
                    debug!(
                        healthy = report.is_healthy(),
                        warnings = report.warnings.len(),
                        "Health supervisor pass"
                    );
                }
            }
        }
        debug!("Health supervisor exiting");
    }
}

/// The monitor, the cache and the processor behind one lifecycle
pub struct Runtime<V: CacheValue = serde_json::Value> {
    ctx: RuntimeContext,
    supervisor: Supervisor<V>,
    health_interval: Duration,
    shutdown: CancellationToken,
    supervisor_task: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<Lifecycle>,
}

impl<V: CacheValue> Runtime<V> {
    /// Validate `config` and build every component
    pub fn new(config: Config, health_interval: Duration) -> Result<Self> {
        Self::with_context(RuntimeContext::new(config)?, health_interval)
    }

    /// Build every component from an existing context
    pub fn with_context(ctx: RuntimeContext, health_interval: Duration) -> Result<Self> {
        if health_interval.is_zero() {
            return Err(Error::Config("health interval must be positive".into()));
        }

        let supervisor = Supervisor {
            monitor: SourceHealthMonitor::new(&ctx),
            cache: TieredCache::new(&ctx),
            processor: ParallelBatchProcessor::new(&ctx),
            telemetry: Telemetry::new()?,
            clock: Arc::clone(ctx.clock()),
            last_report: Arc::new(Mutex::new(None)),
        };

        Ok(Self {
            ctx,
            supervisor,
            health_interval,
            shutdown: CancellationToken::new(),
            supervisor_task: Mutex::new(None),
            state: Mutex::new(Lifecycle::Idle),
        })
    }

    /// Start monitor, cache and supervisor
    ///
    /// If the cache cannot start the monitor is stopped again and the error
    /// returned. Starting a running runtime is a no-op.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                Lifecycle::Idle => *state = Lifecycle::Running,
                Lifecycle::Running => return Ok(()),
                Lifecycle::Stopped => return Err(Error::ShutDown("runtime".into())),
            }
        }

        if let Err(e) = self.start_components().await {
            self.supervisor.monitor.stop().await;
            self.supervisor.cache.stop().await;
            *self.state.lock() = Lifecycle::Stopped;
            return Err(e);
        }

        self.supervisor.check().await;
        let task = tokio::spawn(
            self.supervisor
                .clone()
                .run(self.shutdown.clone(), self.health_interval),
        );
        *self.supervisor_task.lock() = Some(task);

        let config = self.ctx.config();
        info!(
            sources = self.supervisor.monitor.source_count(),
            disk_path = %config.cache.disk_path.display(),
            max_workers = config.parallel_processing.max_workers,
            health_interval_secs = self.health_interval.as_secs(),
            "Runtime started"
        );
        Ok(())
    }

    async fn start_components(&self) -> Result<()> {
        self.supervisor.monitor.start()?;
        self.supervisor.cache.start().await?;
        // The processor needs no start step; it accepts work once built.
        Ok(())
    }

    /// Stop everything in reverse start order, then close the worker pool
    ///
    /// Only the first call does anything.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state == Lifecycle::Stopped {
                return;
            }
            *state = Lifecycle::Stopped;
        }
        info!("Runtime shutting down");

        self.shutdown.cancel();
        let task = self.supervisor_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Health supervisor ended abnormally");
            }
        }

        self.supervisor.processor.shutdown().await;
        self.supervisor.cache.stop().await;
        self.supervisor.monitor.stop().await;
        self.ctx.pool().close().await;
        info!("Runtime stopped");
    }

    /// Run one supervisor pass now
    pub async fn health_check(&self) -> HealthReport {
        self.supervisor.check().await
    }

    /// Report of the most recent supervisor pass
    pub fn last_report(&self) -> Option<HealthReport> {
        self.supervisor.last_report.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock() == Lifecycle::Running
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    pub fn cache(&self) -> &Arc<TieredCache<V>> {
        &self.supervisor.cache
    }

    pub fn monitor(&self) -> &Arc<SourceHealthMonitor> {
        &self.supervisor.monitor
    }

    pub fn processor(&self) -> &Arc<ParallelBatchProcessor> {
        &self.supervisor.processor
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.supervisor.telemetry
    }

    pub fn health_interval(&self) -> Duration {
        self.health_interval
    }
}

impl<V: CacheValue> std::fmt::Debug for Runtime<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("ctx", &self.ctx)
            .field("health_interval", &self.health_interval)
            .field("state", &*self.state.lock())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
