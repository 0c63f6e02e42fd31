//! Sourcekeeper - Data-Source Resilience Core
//!
//! Keeps a data pipeline usable while its upstream APIs are slow, flaky or
//! down: fetched values are cached in two tiers, each source's error rate and
//! latency are watched with automatic reconnects, and bulk work is fanned out
//! over a bounded worker pool with timeouts, retries and fallbacks.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────── Runtime ─────────────┐
//!                    │                                  │
//!   fetch results ──►│ TieredCache      memory ⇄ disk   │
//!   request stats ──►│ SourceHealthMonitor ─► reconnect │──► /metrics
//!   bulk items    ──►│ ParallelBatchProcessor ─► pool   │
//!                    │                                  │
//!                    └── RuntimeContext (config, pool, clock)
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Memory + disk cache with TTLs and eviction policies
//! - [`monitor`] - Per-source health checks and reconnect backoff
//! - [`processor`] - Chunked parallel batch execution
//! - [`runtime`] - Lifecycle of all components plus the health supervisor
//! - [`telemetry`] - Prometheus gauges for the above
//! - [`config`] - YAML configuration
//! - [`error`] - Error types

pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod monitor;
pub mod pool;
pub mod processor;
pub mod retry;
pub mod runtime;
pub mod telemetry;

// Re-export commonly used types
pub use cache::{CacheStats, EvictionStrategy, PreloadItem, PreloadOutcome, TieredCache};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use context::RuntimeContext;
pub use error::{Error, Result};
pub use monitor::{Reconnector, SourceHealthMonitor, SourceStatus, SourceStatusSnapshot};
pub use processor::{ParallelBatchProcessor, TaskError, TaskResult};
pub use runtime::{HealthReport, Runtime};
pub use telemetry::Telemetry;
