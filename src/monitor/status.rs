//! Source Status
//!
//! ```text
//! Unknown ──samples──► Healthy ◄──────────────┐
//!                        │ error rate > limit │ reconnect ok
//!                        ▼                    │
//!                     Degraded ──► Reconnecting
//!                        ▲              │
//!                        └─ exhausted ──┤
//!                                       └─ monitor stopped ──► Unknown
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health of one data source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    /// No information yet
    #[default]
    Unknown,
    /// Error rate within the threshold
    Healthy,
    /// Error rate above the threshold
    Degraded,
    /// A reconnect sequence is running
    Reconnecting,
}

impl SourceStatus {
    /// Check if status is healthy
    pub fn is_healthy(&self) -> bool {
        *self == SourceStatus::Healthy
    }

    /// Numeric code for gauges
    pub fn code(&self) -> i64 {
        match self {
            SourceStatus::Unknown => 0,
            SourceStatus::Healthy => 1,
            SourceStatus::Degraded => 2,
            SourceStatus::Reconnecting => 3,
        }
    }
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceStatus::Unknown => write!(f, "unknown"),
            SourceStatus::Healthy => write!(f, "healthy"),
            SourceStatus::Degraded => write!(f, "degraded"),
            SourceStatus::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Point-in-time view of one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatusSnapshot {
    pub source: String,
    pub status: SourceStatus,
    pub error_rate: f64,
    pub avg_response_time: Option<Duration>,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub sample_count: usize,
}

impl SourceStatusSnapshot {
    /// Snapshot for a source nothing is known about
    pub fn unknown(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            status: SourceStatus::Unknown,
            error_rate: 0.0,
            avg_response_time: None,
            last_error: None,
            last_success_at: None,
            sample_count: 0,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_healthy_and_codes() {
        assert!(SourceStatus::Healthy.is_healthy());
        assert!(!SourceStatus::Reconnecting.is_healthy());
        assert_eq!(SourceStatus::default(), SourceStatus::Unknown);
        assert_eq!(SourceStatus::Degraded.code(), 2);
    }

    #[test]
    fn test_display_and_serde() {
        assert_eq!(SourceStatus::Reconnecting.to_string(), "reconnecting");
        let json = serde_json::to_string(&SourceStatus::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
    }

    #[test]
    fn test_unknown_snapshot() {
        let snap = SourceStatusSnapshot::unknown("ghost");
        assert_eq!(snap.status, SourceStatus::Unknown);
        assert_eq!(snap.error_rate, 0.0);
        assert_eq!(snap.sample_count, 0);
    }
}
