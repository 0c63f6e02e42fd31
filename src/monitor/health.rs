//! Source Health Monitor
//!
//! Tracks request outcomes per named source, raises alerts when the error
//! rate or latency crosses its threshold and drives exponential-backoff
//! reconnects.
//!
//! # Design
//!
//! - One check loop per source, spawned on [`start`](SourceHealthMonitor::start)
//!   for configured sources and lazily for sources first seen afterwards
//! - Readers take short `parking_lot` locks and never wait on a reconnect
//! - Loops are tracked by a `TaskTracker` and cancelled through one
//!   `CancellationToken`; `stop()` awaits all of them

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::metrics::{RequestSample, SourceMetrics};
use super::reconnect::{AlwaysReconnect, Reconnector};
use super::status::{SourceStatus, SourceStatusSnapshot};
use crate::clock::SharedClock;
use crate::config::{HealthMonitorSettings, SourceSettings};
use crate::context::RuntimeContext;
use crate::error::{Error, Result};
use crate::retry::BackoffPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Everything the monitor keeps about one source
struct SourceState {
    settings: Mutex<SourceSettings>,
    reconnector: Mutex<Arc<dyn Reconnector>>,
    metrics: Mutex<SourceMetrics>,
    status: Mutex<SourceStatus>,
    loop_spawned: AtomicBool,
}

impl SourceState {
    fn new(settings: SourceSettings, reconnector: Arc<dyn Reconnector>) -> Self {
        Self {
            settings: Mutex::new(settings),
            reconnector: Mutex::new(reconnector),
            metrics: Mutex::new(SourceMetrics::new()),
            status: Mutex::new(SourceStatus::Unknown),
            loop_spawned: AtomicBool::new(false),
        }
    }

    fn set_status(&self, status: SourceStatus) {
        *self.status.lock() = status;
    }

    fn status(&self) -> SourceStatus {
        *self.status.lock()
    }

    /// Move to `next` unless a reconnect sequence owns the source
    ///
    /// Moving to `Reconnecting` claims the sequence, so at most one caller
    /// gets `true` until the reconnect settles.
    fn transition(&self, next: SourceStatus) -> bool {
        let mut status = self.status.lock();
        if *status == SourceStatus::Reconnecting {
            return false;
        }
        *status = next;
        true
    }
}

/// Health monitor for a set of named data sources
pub struct SourceHealthMonitor {
    settings: HealthMonitorSettings,
    backoff: BackoffPolicy,
    default_source: SourceSettings,
    clock: SharedClock,
    sources: DashMap<String, Arc<SourceState>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    runtime: Mutex<Option<Handle>>,
    state: Mutex<Lifecycle>,
    this: Weak<SourceHealthMonitor>,
}

impl SourceHealthMonitor {
    /// Build a monitor; sources named under `data_sources` are registered
    /// with the default reconnector
    pub fn new(ctx: &RuntimeContext) -> Arc<Self> {
        let config = ctx.config();
        let default_source = SourceSettings {
            health_check_interval: config.health_monitor.default_check_interval,
            auto_reconnect: true,
        };

        Arc::new_cyclic(|this| {
            let sources = DashMap::new();
            for (name, settings) in &config.data_sources {
                sources.insert(
                    name.clone(),
                    Arc::new(SourceState::new(settings.clone(), Arc::new(AlwaysReconnect))),
                );
            }

            Self {
                settings: config.health_monitor.clone(),
                backoff: BackoffPolicy::from(&config.retry_strategy),
                default_source,
                clock: Arc::clone(ctx.clock()),
                sources,
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                runtime: Mutex::new(None),
                state: Mutex::new(Lifecycle::Idle),
                this: this.clone(),
            }
        })
    }

    /// Spawn a check loop for every known source
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                Lifecycle::Idle => *state = Lifecycle::Running,
                Lifecycle::Running => return Ok(()),
                Lifecycle::Stopped => {
                    return Err(Error::ShutDown("source health monitor".into()))
                }
            }
        }

        let handle = Handle::try_current()
            .map_err(|e| Error::Internal(format!("health monitor needs a tokio runtime: {}", e)))?;
        *self.runtime.lock() = Some(handle);

        let names: Vec<String> = self.sources.iter().map(|s| s.key().clone()).collect();
        for name in &names {
            self.ensure_loop(name);
        }

        info!(
            sources = names.len(),
            alert_threshold = self.settings.alert_threshold,
            "Source health monitor started"
        );
        Ok(())
    }

    /// Cancel every check loop and wait for them
    ///
    /// A reconnect in progress is abandoned and its source reports
    /// `Unknown`. Calling it again is a no-op.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == Lifecycle::Stopped {
                return;
            }
            *state = Lifecycle::Stopped;
        }

        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.runtime.lock().take();

        for entry in self.sources.iter() {
            let mut status = entry.value().status.lock();
            if *status == SourceStatus::Reconnecting {
                *status = SourceStatus::Unknown;
            }
        }
        info!("Source health monitor stopped");
    }

    /// Record the outcome of one request to `source`
    pub fn record_request(
        &self,
        source: &str,
        success: bool,
        response_time: Option<Duration>,
        error: Option<String>,
    ) {
        let state = self.source_state(source);
        let sample = RequestSample {
            at: self.clock.now(),
            success,
            response_time,
        };
        state.metrics.lock().record(sample, error);

        if self.is_running() {
            self.ensure_loop(source);
        }
    }

    /// Attach settings and a reconnector to `source`
    ///
    /// Metrics already gathered for the source are kept.
    pub fn register_source(
        &self,
        source: &str,
        settings: SourceSettings,
        reconnector: Arc<dyn Reconnector>,
    ) {
        match self.sources.get(source).map(|s| Arc::clone(s.value())) {
            Some(state) => {
                *state.settings.lock() = settings;
                *state.reconnector.lock() = reconnector;
            }
            None => {
                self.sources
                    .insert(source.to_string(), Arc::new(SourceState::new(settings, reconnector)));
            }
        }
        debug!(source, "Source registered");

        if self.is_running() {
            self.ensure_loop(source);
        }
    }

    /// Run one check cycle for `source` now
    ///
    /// Returns `None` for a source nothing was recorded for.
    pub async fn check_source(&self, source: &str) -> Option<SourceStatusSnapshot> {
        let state = self.sources.get(source).map(|s| Arc::clone(s.value()))?;

        let (error_rate, avg_response_time, samples) = {
            let mut metrics = state.metrics.lock();
            metrics.purge(self.clock.now(), self.settings.retention());
            (
                metrics.error_rate(),
                metrics.avg_response_time(),
                metrics.sample_count(),
            )
        };

        if state.status() == SourceStatus::Reconnecting {
            debug!(source, "Reconnect already running, skipping check");
            return Some(self.snapshot(source, &state));
        }

        if samples == 0 {
            debug!(source, "No samples in window");
            return Some(self.snapshot(source, &state));
        }

        if let Some(avg) = avg_response_time {
            if avg > self.settings.performance_threshold() {
                warn!(
                    source,
                    avg_response_ms = avg.as_millis() as u64,
                    threshold_ms = self.settings.performance_threshold,
                    "Source response time above threshold"
                );
            }
        }

        if error_rate > self.settings.alert_threshold {
            let auto_reconnect = state.settings.lock().auto_reconnect;
            let next = if auto_reconnect {
                SourceStatus::Reconnecting
            } else {
                SourceStatus::Degraded
            };
            if !state.transition(next) {
                debug!(source, "Reconnect started concurrently, skipping check");
                return Some(self.snapshot(source, &state));
            }
            warn!(
                source,
                error_rate,
                threshold = self.settings.alert_threshold,
                "Source error rate above threshold"
            );
            if auto_reconnect {
                self.reconnect(source, &state).await;
            }
        } else if !state.transition(SourceStatus::Healthy) {
            debug!(source, "Reconnect started concurrently, skipping check");
            return Some(self.snapshot(source, &state));
        }

        let snapshot = self.snapshot(source, &state);
        info!(
            source,
            status = %snapshot.status,
            error_rate = snapshot.error_rate,
            avg_response_ms = snapshot.avg_response_time.map(|d| d.as_millis() as u64),
            samples = snapshot.sample_count,
            "Source health check"
        );
        Some(snapshot)
    }

    /// Status of one source; unknown sources report `Unknown`
    pub fn source_status(&self, source: &str) -> SourceStatusSnapshot {
        match self.sources.get(source).map(|s| Arc::clone(s.value())) {
            Some(state) => self.snapshot(source, &state),
            None => SourceStatusSnapshot::unknown(source),
        }
    }

    /// Status of every known source
    pub fn all_source_status(&self) -> BTreeMap<String, SourceStatusSnapshot> {
        let states: Vec<(String, Arc<SourceState>)> = self
            .sources
            .iter()
            .map(|s| (s.key().clone(), Arc::clone(s.value())))
            .collect();
        states
            .into_iter()
            .map(|(name, state)| {
                let snapshot = self.snapshot(&name, &state);
                (name, snapshot)
            })
            .collect()
    }

    /// Whether the check loops are running
    pub fn is_running(&self) -> bool {
        *self.state.lock() == Lifecycle::Running
    }

    /// Number of sources seen or configured
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    fn source_state(&self, source: &str) -> Arc<SourceState> {
        if let Some(state) = self.sources.get(source) {
            return Arc::clone(state.value());
        }
        let entry = self.sources.entry(source.to_string()).or_insert_with(|| {
            debug!(source, "Tracking new source");
            Arc::new(SourceState::new(
                self.default_source.clone(),
                Arc::new(AlwaysReconnect),
            ))
        });
        Arc::clone(entry.value())
    }

    fn snapshot(&self, source: &str, state: &SourceState) -> SourceStatusSnapshot {
        let mut metrics = state.metrics.lock();
        metrics.purge(self.clock.now(), self.settings.retention());
        let error_rate = metrics.error_rate();
        let sample_count = metrics.sample_count();

        SourceStatusSnapshot {
            source: source.to_string(),
            status: state.status(),
            error_rate,
            avg_response_time: metrics.avg_response_time(),
            last_error: metrics.last_error().map(str::to_string),
            last_success_at: metrics.last_success_at(),
            sample_count,
        }
    }

    fn ensure_loop(&self, source: &str) {
        let Some(state) = self.sources.get(source).map(|s| Arc::clone(s.value())) else {
            return;
        };
        if state.loop_spawned.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some(handle) = self.runtime.lock().clone() else {
            state.loop_spawned.store(false, Ordering::SeqCst);
            return;
        };

        self.tasks.spawn_on(
            check_loop(
                self.this.clone(),
                source.to_string(),
                state,
                self.shutdown.clone(),
            ),
            &handle,
        );
        debug!(source, "Health check loop spawned");
    }

    /// Caller must have moved the source to `Reconnecting`
    async fn reconnect(&self, source: &str, state: &SourceState) -> bool {
        let reconnector = Arc::clone(&*state.reconnector.lock());

        for attempt in 1..=self.backoff.max_attempts {
            let delay = self.backoff.delay_for(attempt);
            info!(source, attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

            let result = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                result = async {
                    tokio::time::sleep(delay).await;
                    reconnector.reconnect(source).await
                } => Some(result),
            };

            match result {
                None => {
                    state.set_status(SourceStatus::Unknown);
                    info!(source, "Reconnect abandoned, monitor stopping");
                    return false;
                }
                Some(Ok(())) => {
                    state.metrics.lock().reset();
                    state.set_status(SourceStatus::Healthy);
                    info!(source, attempt, "Reconnected");
                    return true;
                }
                Some(Err(e)) => {
                    warn!(source, attempt, error = %e, "Reconnect attempt failed");
                }
            }
        }

        state.set_status(SourceStatus::Degraded);
        error!(
            source,
            attempts = self.backoff.max_attempts,
            "Reconnect attempts exhausted"
        );
        false
    }
}

#[instrument(skip_all, fields(source = %source))]
async fn check_loop(
    monitor: Weak<SourceHealthMonitor>,
    source: String,
    state: Arc<SourceState>,
    shutdown: CancellationToken,
) {
    loop {
        let period = state.settings.lock().check_interval();
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }

        let Some(monitor) = monitor.upgrade() else { break };
        monitor.check_source(&source).await;
    }
    debug!("Health check loop exited");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use std::sync::atomic::AtomicU32;

    /// Fails the first `failures` attempts, then succeeds
    #[derive(Default)]
    struct ScriptedReconnector {
        failures: u32,
        attempts: AtomicU32,
    }

    impl ScriptedReconnector {
        fn failing(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                attempts: AtomicU32::new(0),
            })
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Reconnector for ScriptedReconnector {
        async fn reconnect(&self, source: &str) -> Result<()> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                Err(Error::reconnect(source, format!("attempt {} refused", n)))
            } else {
                Ok(())
            }
        }
    }

    fn monitor_with(config: Config) -> Arc<SourceHealthMonitor> {
        let ctx = RuntimeContext::new(config).unwrap();
        SourceHealthMonitor::new(&ctx)
    }

    fn monitor() -> Arc<SourceHealthMonitor> {
        monitor_with(Config::default())
    }

    fn record_mix(monitor: &SourceHealthMonitor, source: &str, ok: usize, failed: usize) {
        for _ in 0..ok {
            monitor.record_request(source, true, Some(Duration::from_millis(100)), None);
        }
        for _ in 0..failed {
            monitor.record_request(source, false, None, Some("HTTP 503".into()));
        }
    }

    fn manual_settings() -> SourceSettings {
        SourceSettings {
            health_check_interval: 3600,
            auto_reconnect: true,
        }
    }

    #[test]
    fn test_record_and_snapshot() {
        let monitor = monitor();
        record_mix(&monitor, "tushare", 9, 1);

        let snap = monitor.source_status("tushare");
        assert_eq!(snap.sample_count, 10);
        assert!((snap.error_rate - 0.1).abs() < 1e-9);
        assert_eq!(snap.avg_response_time, Some(Duration::from_millis(100)));
        assert_eq!(snap.last_error.as_deref(), Some("HTTP 503"));
        assert!(snap.last_success_at.is_some());
        // Status only changes on a check
        assert_eq!(snap.status, SourceStatus::Unknown);
    }

    #[test]
    fn test_unknown_source() {
        let monitor = monitor();
        let snap = monitor.source_status("ghost");
        assert_eq!(snap, SourceStatusSnapshot::unknown("ghost"));
        assert_eq!(monitor.source_count(), 0);
    }

    #[test]
    fn test_configured_sources_listed() {
        let mut config = Config::default();
        config.data_sources.insert("akshare".into(), SourceSettings::default());
        config.data_sources.insert("tushare".into(), SourceSettings::default());
        let monitor = monitor_with(config);

        let all = monitor.all_source_status();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["akshare", "tushare"]);
        assert!(all.values().all(|s| s.status == SourceStatus::Unknown));
    }

    #[test]
    fn test_retention_window() {
        let clock = ManualClock::starting_now();
        let mut config = Config::default();
        config.health_monitor.metrics_retention = 60;
        let ctx = RuntimeContext::with_clock(config, clock.clone()).unwrap();
        let monitor = SourceHealthMonitor::new(&ctx);

        record_mix(&monitor, "s", 0, 5);
        clock.advance(Duration::from_secs(61));
        record_mix(&monitor, "s", 5, 0);

        let snap = monitor.source_status("s");
        assert_eq!(snap.sample_count, 5);
        assert_eq!(snap.error_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_below_threshold_is_healthy() {
        let monitor = monitor();
        record_mix(&monitor, "s", 9, 1);
        let snap = monitor.check_source("s").await.unwrap();
        assert_eq!(snap.status, SourceStatus::Healthy);
        assert!(monitor.check_source("never-seen").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_only_warns() {
        let monitor = monitor();
        for _ in 0..5 {
            monitor.record_request("slow", true, Some(Duration::from_secs(10)), None);
        }
        let snap = monitor.check_source("slow").await.unwrap();
        assert_eq!(snap.status, SourceStatus::Healthy);
        assert_eq!(snap.sample_count, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_source_reconnects() {
        let monitor = monitor();
        let reconnector = ScriptedReconnector::failing(0);
        monitor.register_source("s", manual_settings(), reconnector.clone());
        record_mix(&monitor, "s", 5, 5);

        let started = tokio::time::Instant::now();
        let snap = monitor.check_source("s").await.unwrap();

        assert_eq!(reconnector.attempts(), 1);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_millis(1_100));
        assert_eq!(snap.status, SourceStatus::Healthy);
        assert_eq!(snap.sample_count, 0);
        assert_eq!(snap.last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_and_exhaustion() {
        let mut config = Config::default();
        config.retry_strategy.initial_delay = 1.0;
        config.retry_strategy.max_delay = 3.0;
        config.retry_strategy.max_attempts = 4;
        let monitor = monitor_with(config);
        let reconnector = ScriptedReconnector::failing(u32::MAX);
        monitor.register_source("s", manual_settings(), reconnector.clone());
        record_mix(&monitor, "s", 0, 10);

        let started = tokio::time::Instant::now();
        let snap = monitor.check_source("s").await.unwrap();

        // 1 + 2 + 3 + 3
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(9) && elapsed < Duration::from_millis(9_100));
        assert_eq!(reconnector.attempts(), 4);
        assert_eq!(snap.status, SourceStatus::Degraded);
        assert_eq!(snap.sample_count, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_succeeds_after_failures() {
        let monitor = monitor();
        let reconnector = ScriptedReconnector::failing(2);
        monitor.register_source("s", manual_settings(), reconnector.clone());
        record_mix(&monitor, "s", 0, 10);

        let started = tokio::time::Instant::now();
        let snap = monitor.check_source("s").await.unwrap();
        // 1 + 2 + 4
        assert!(started.elapsed() >= Duration::from_secs(7));
        assert!(started.elapsed() < Duration::from_millis(7_100));
        assert_eq!(reconnector.attempts(), 3);
        assert_eq!(snap.status, SourceStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_reconnect_disabled() {
        let monitor = monitor();
        let reconnector = ScriptedReconnector::failing(0);
        let settings = SourceSettings {
            health_check_interval: 3600,
            auto_reconnect: false,
        };
        monitor.register_source("s", settings, reconnector.clone());
        record_mix(&monitor, "s", 0, 3);

        let snap = monitor.check_source("s").await.unwrap();
        assert_eq!(snap.status, SourceStatus::Degraded);
        assert_eq!(reconnector.attempts(), 0);
    }

    #[test]
    fn test_reconnecting_source_cannot_be_claimed_twice() {
        let state = SourceState::new(manual_settings(), Arc::new(AlwaysReconnect));
        assert!(state.transition(SourceStatus::Reconnecting));
        assert!(!state.transition(SourceStatus::Reconnecting));
        assert!(!state.transition(SourceStatus::Healthy));
        assert_eq!(state.status(), SourceStatus::Reconnecting);

        state.set_status(SourceStatus::Degraded);
        assert!(state.transition(SourceStatus::Reconnecting));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_checks_start_one_reconnect() {
        let monitor = monitor();
        let reconnector = ScriptedReconnector::failing(0);
        monitor.register_source("s", manual_settings(), reconnector.clone());
        record_mix(&monitor, "s", 0, 10);

        let (first, second) = tokio::join!(monitor.check_source("s"), monitor.check_source("s"));

        assert_eq!(reconnector.attempts(), 1);
        assert_eq!(first.unwrap().status, SourceStatus::Healthy);
        assert_eq!(second.unwrap().status, SourceStatus::Reconnecting);
        assert_eq!(monitor.source_status("s").status, SourceStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reads_do_not_wait_for_reconnect() {
        let mut config = Config::default();
        config.retry_strategy.initial_delay = 30.0;
        let monitor = monitor_with(config);
        monitor.register_source("s", manual_settings(), ScriptedReconnector::failing(u32::MAX));
        record_mix(&monitor, "s", 0, 10);

        let checker = Arc::clone(&monitor);
        let check = tokio::spawn(async move { checker.check_source("s").await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(monitor.source_status("s").status, SourceStatus::Reconnecting);
        monitor.start().unwrap();
        monitor.stop().await;

        check.await.unwrap();
        assert_eq!(monitor.source_status("s").status, SourceStatus::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loops_check_configured_sources() {
        let mut config = Config::default();
        config.data_sources.insert(
            "tushare".into(),
            SourceSettings {
                health_check_interval: 10,
                auto_reconnect: true,
            },
        );
        let monitor = monitor_with(config);
        let reconnector = ScriptedReconnector::failing(0);
        monitor.register_source(
            "tushare",
            SourceSettings {
                health_check_interval: 10,
                auto_reconnect: true,
            },
            reconnector.clone(),
        );
        monitor.start().unwrap();
        record_mix(&monitor, "tushare", 0, 4);

        // First check at 10s, reconnect after a 1s delay
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(reconnector.attempts(), 1);
        assert_eq!(monitor.source_status("tushare").status, SourceStatus::Healthy);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfigured_source_gets_loop_lazily() {
        let mut config = Config::default();
        config.health_monitor.default_check_interval = 5;
        let monitor = monitor_with(config);
        monitor.start().unwrap();

        record_mix(&monitor, "adhoc", 0, 4);
        assert_eq!(monitor.source_status("adhoc").status, SourceStatus::Unknown);

        // Check at 5s, default reconnector succeeds after 1s
        tokio::time::sleep(Duration::from_secs(7)).await;
        let snap = monitor.source_status("adhoc");
        assert_eq!(snap.status, SourceStatus::Healthy);
        assert_eq!(snap.sample_count, 0);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_lifecycle_is_idempotent() {
        let monitor = monitor();
        monitor.start().unwrap();
        monitor.start().unwrap();
        assert!(monitor.is_running());
        monitor.stop().await;
        monitor.stop().await;
        assert!(!monitor.is_running());
        assert!(matches!(monitor.start(), Err(Error::ShutDown(_))));
    }
}
