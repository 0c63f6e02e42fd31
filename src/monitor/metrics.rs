//! Per-Source Request Metrics
//!
//! A bounded sliding window of request samples. The window is capped at
//! [`MAX_SAMPLES`] (oldest dropped) and samples older than the retention
//! period are purged before any rate is computed.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::elapsed_between;

/// Samples kept per source
pub const MAX_SAMPLES: usize = 1000;

/// One observed request
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSample {
    pub at: DateTime<Utc>,
    pub success: bool,
    pub response_time: Option<Duration>,
}

/// Sliding window for one source
#[derive(Debug, Clone, Default)]
pub struct SourceMetrics {
    samples: VecDeque<RequestSample>,
    last_error: Option<String>,
    last_success_at: Option<DateTime<Utc>>,
}

impl SourceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample, dropping the oldest past [`MAX_SAMPLES`]
    pub fn record(&mut self, sample: RequestSample, error: Option<String>) {
        if sample.success {
            self.last_success_at = Some(sample.at);
        } else if let Some(error) = error {
            self.last_error = Some(error);
        }

        if self.samples.len() == MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Drop samples older than `retention`; returns how many were dropped
    pub fn purge(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let before = self.samples.len();
        self.samples
            .retain(|sample| elapsed_between(sample.at, now) <= retention);
        before - self.samples.len()
    }

    /// Failed fraction of the window, 0 when empty
    pub fn error_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failures = self.samples.iter().filter(|s| !s.success).count();
        failures as f64 / self.samples.len() as f64
    }

    /// Mean response time over samples that carry one
    pub fn avg_response_time(&self) -> Option<Duration> {
        let mut total = Duration::ZERO;
        let mut count = 0u32;
        for time in self.samples.iter().filter_map(|s| s.response_time) {
            total += time;
            count += 1;
        }
        if count == 0 {
            None
        } else {
            Some(total / count)
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        self.last_success_at
    }

    /// Clear the window and the last error after a reconnect
    pub fn reset(&mut self) {
        self.samples.clear();
        self.last_error = None;
    }
}

// =============================================================================
// Tests
// =============================================================================
