//! Exponential Backoff
//!
//! Shared by the monitor's reconnect sequence (capped) and the processor's
//! retry loop (uncapped).

use std::time::Duration;

/// Exponential backoff schedule
///
/// The delay before attempt `n` (1-based) is `initial * 2^(n-1)`, clamped to
/// `max_delay` when one is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Option<Duration>,
    /// Number of attempts in one sequence
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Capped schedule
    pub fn capped(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_delay: Some(max_delay),
            max_attempts,
        }
    }

    /// Uncapped schedule
    pub fn uncapped(initial_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_delay: None,
            max_attempts,
        }
    }

    /// Delay before attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .initial_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Delays for every attempt of one sequence, in order
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).map(move |attempt| self.delay_for(attempt))
    }
}

impl From<&crate::config::RetrySettings> for BackoffPolicy {
    fn from(settings: &crate::config::RetrySettings) -> Self {
        Self::capped(
            settings.initial_delay(),
            settings.max_delay(),
            settings.max_attempts,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capped_sequence() {
        let policy = BackoffPolicy::capped(Duration::from_secs(1), Duration::from_secs(8), 6);
        let delays: Vec<u64> = policy.delays().map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);
    }

    #[test]
    fn test_uncapped_sequence() {
        let policy = BackoffPolicy::uncapped(Duration::from_millis(100), 4);
        let delays: Vec<u128> = policy.delays().map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800]);
    }

    #[test]
    fn test_large_attempt_saturates() {
        let policy = BackoffPolicy::uncapped(Duration::from_secs(1), 1);
        assert_eq!(policy.delay_for(200), Duration::from_secs(1u64 << 31));
        let capped = BackoffPolicy::capped(Duration::from_secs(1), Duration::from_secs(60), 1);
        assert_eq!(capped.delay_for(200), Duration::from_secs(60));
    }

    #[test]
    fn test_from_settings() {
        let settings = crate::config::RetrySettings {
            max_attempts: 4,
            initial_delay: 0.5,
            max_delay: 2.0,
        };
        let policy = BackoffPolicy::from(&settings);
        let delays: Vec<u128> = policy.delays().map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 2000]);
    }
}
