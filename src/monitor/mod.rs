//! Data Source Health Monitoring
//!
//! Rolling error-rate and latency per named upstream source, threshold
//! alerts and exponential-backoff reconnects.
//!
//! # Architecture
//!
//! ```text
//! callers ──record_request──► SourceMetrics (sliding window, per source)
//!                                   │
//!               check loop (health_check_interval, per source)
//!                                   │
//!                 error rate > alert_threshold ──► Degraded
//!                                   │ auto_reconnect
//!                                   ▼
//!                 Reconnector (backoff: initial * 2^(n-1), capped)
//! ```

mod health;
mod metrics;
mod reconnect;
mod status;

pub use health::SourceHealthMonitor;
pub use metrics::{RequestSample, SourceMetrics, MAX_SAMPLES};
pub use reconnect::{AlwaysReconnect, Reconnector};
pub use status::{SourceStatus, SourceStatusSnapshot};
