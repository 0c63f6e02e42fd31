//! Configuration Surface
//!
//! Loaded once at process start (YAML) and handed to each component through
//! the [`RuntimeContext`](crate::context::RuntimeContext). Every field has a
//! default, so a partial file is valid.
//!
//! ```yaml
//! cache:
//!   memory_cache_size: 100      # MB
//!   disk_path: cache
//!   strategy: adaptive          # lru | fifo | adaptive
//!   cleanup_interval: 300       # seconds
//! health_monitor:
//!   alert_threshold: 0.2        # error rate 0..1
//!   performance_threshold: 5000 # milliseconds
//!   metrics_retention: 86400    # seconds
//! retry_strategy:
//!   max_attempts: 3
//!   initial_delay: 1            # seconds
//!   max_delay: 60               # seconds
//! parallel_processing:
//!   max_workers: 8
//!   chunk_size: 50
//!   timeout: 30                 # seconds
//! data_sources:
//!   tushare:
//!     health_check_interval: 60
//!     auto_reconnect: true
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::EvictionStrategy;
use crate::error::{Error, Result};

/// Bytes per configured megabyte
const BYTES_PER_MB: u64 = 1024 * 1024;

// =============================================================================
// Sections
// =============================================================================

/// `cache` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Memory tier budget in megabytes
    pub memory_cache_size: u64,
    /// Directory holding the disk tier
    pub disk_path: PathBuf,
    /// Eviction strategy for the memory tier
    pub strategy: EvictionStrategy,
    /// Seconds between expiry sweeps
    pub cleanup_interval: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            memory_cache_size: 100,
            disk_path: PathBuf::from("cache"),
            strategy: EvictionStrategy::default(),
            cleanup_interval: 300,
        }
    }
}

impl CacheSettings {
    /// Memory budget in bytes
    pub fn memory_budget(&self) -> u64 {
        self.memory_cache_size.saturating_mul(BYTES_PER_MB)
    }

    /// Interval between expiry sweeps
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }
}

/// `health_monitor` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthMonitorSettings {
    /// Error rate above which a source is Degraded
    pub alert_threshold: f64,
    /// Mean response time (ms) above which a warning is logged
    pub performance_threshold: f64,
    /// Sliding window length in seconds
    pub metrics_retention: u64,
    /// Check interval for sources that are observed but not configured
    pub default_check_interval: u64,
}

impl Default for HealthMonitorSettings {
    fn default() -> Self {
        Self {
            alert_threshold: 0.2,
            performance_threshold: 5000.0,
            metrics_retention: 86_400,
            default_check_interval: 60,
        }
    }
}

impl HealthMonitorSettings {
    /// Sliding window length
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.metrics_retention)
    }

    /// Latency threshold
    pub fn performance_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.performance_threshold.max(0.0) / 1000.0)
    }
}

/// `retry_strategy` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Reconnect attempts per cycle
    pub max_attempts: u32,
    /// First backoff delay in seconds
    pub initial_delay: f64,
    /// Backoff cap in seconds
    pub max_delay: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: 1.0,
            max_delay: 60.0,
        }
    }
}

impl RetrySettings {
    /// First backoff delay
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs_f64(self.initial_delay)
    }

    /// Backoff cap
    pub fn max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.max_delay)
    }
}

/// `parallel_processing` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelSettings {
    /// Size of the shared blocking worker pool
    pub max_workers: usize,
    /// Default items per chunk
    pub chunk_size: usize,
    /// Default chunk timeout in seconds
    pub timeout: f64,
}

impl Default for ParallelSettings {
    fn default() -> Self {
        Self {
            max_workers: 8,
            chunk_size: 50,
            timeout: 30.0,
        }
    }
}

impl ParallelSettings {
    /// Default chunk timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }
}

/// One entry of the `data_sources` map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// Seconds between health checks for this source
    pub health_check_interval: u64,
    /// Start a reconnect sequence when the source degrades
    pub auto_reconnect: bool,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            health_check_interval: 60,
            auto_reconnect: true,
        }
    }
}

impl SourceSettings {
    /// Interval between health checks
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }
}

// =============================================================================
// Root
// =============================================================================

/// Full configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheSettings,
    pub health_monitor: HealthMonitorSettings,
    pub retry_strategy: RetrySettings,
    pub parallel_processing: ParallelSettings,
    pub data_sources: BTreeMap<String, SourceSettings>,
}

impl Config {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Reject values the components cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cache.memory_cache_size == 0 {
            return Err(Error::Config("cache.memory_cache_size must be > 0".into()));
        }
        if self.cache.disk_path.as_os_str().is_empty() {
            return Err(Error::Config("cache.disk_path must not be empty".into()));
        }
        if self.cache.cleanup_interval == 0 {
            return Err(Error::Config("cache.cleanup_interval must be > 0".into()));
        }

        let hm = &self.health_monitor;
        if !(0.0..=1.0).contains(&hm.alert_threshold) {
            return Err(Error::Config(format!(
                "health_monitor.alert_threshold must be within 0..1, got {}",
                hm.alert_threshold
            )));
        }
        if hm.performance_threshold < 0.0 {
            return Err(Error::Config(
                "health_monitor.performance_threshold must be >= 0".into(),
            ));
        }
        if hm.metrics_retention == 0 || hm.default_check_interval == 0 {
            return Err(Error::Config(
                "health_monitor intervals must be > 0".into(),
            ));
        }

        let retry = &self.retry_strategy;
        if retry.max_attempts == 0 {
            return Err(Error::Config("retry_strategy.max_attempts must be > 0".into()));
        }
        if !(retry.initial_delay.is_finite() && retry.max_delay.is_finite())
            || retry.initial_delay < 0.0
            || retry.initial_delay > retry.max_delay
        {
            return Err(Error::Config(format!(
                "retry_strategy delays invalid: initial {} max {}",
                retry.initial_delay, retry.max_delay
            )));
        }

        let pp = &self.parallel_processing;
        if pp.max_workers == 0 || pp.chunk_size == 0 {
            return Err(Error::Config(
                "parallel_processing.max_workers and chunk_size must be > 0".into(),
            ));
        }
        if !pp.timeout.is_finite() || pp.timeout <= 0.0 {
            return Err(Error::Config("parallel_processing.timeout must be > 0".into()));
        }

        for (name, source) in &self.data_sources {
            if source.health_check_interval == 0 {
                return Err(Error::Config(format!(
                    "data_sources.{}.health_check_interval must be > 0",
                    name
                )));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.memory_budget(), 100 * 1024 * 1024);
        assert_eq!(config.cache.strategy, EvictionStrategy::Adaptive);
    }

    #[test]
    fn test_parse_full_document() {
        let yaml = r#"
cache:
  memory_cache_size: 200
  disk_path: /tmp/sk-cache
  strategy: lru
  cleanup_interval: 120
health_monitor:
  alert_threshold: 0.3
  performance_threshold: 1500
  metrics_retention: 3600
retry_strategy:
  max_attempts: 5
  initial_delay: 0.5
  max_delay: 8
parallel_processing:
  max_workers: 4
  chunk_size: 10
  timeout: 12.5
data_sources:
  tushare:
    health_check_interval: 30
    auto_reconnect: true
  akshare:
    health_check_interval: 90
    auto_reconnect: false
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.cache.memory_cache_size, 200);
        assert_eq!(config.cache.strategy, EvictionStrategy::Lru);
        assert_eq!(config.cache.cleanup_interval(), Duration::from_secs(120));
        assert_eq!(
            config.health_monitor.performance_threshold(),
            Duration::from_millis(1500)
        );
        assert_eq!(config.retry_strategy.initial_delay(), Duration::from_millis(500));
        assert_eq!(config.parallel_processing.timeout(), Duration::from_millis(12_500));
        assert_eq!(config.data_sources.len(), 2);
        assert!(!config.data_sources["akshare"].auto_reconnect);
        // Unspecified fields keep defaults
        assert_eq!(config.health_monitor.default_check_interval, 60);
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config = Config::from_yaml_str("cache:\n  strategy: fifo\n").unwrap();
        assert_eq!(config.cache.strategy, EvictionStrategy::Fifo);
        assert_eq!(config.parallel_processing, ParallelSettings::default());
    }

    #[test]
    fn test_rejects_unknown_strategy() {
        let err = Config::from_yaml_str("cache:\n  strategy: random\n").unwrap_err();
        assert!(matches!(err, Error::Yaml(_)));
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let mut config = Config::default();
        config.health_monitor.alert_threshold = 1.5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_inverted_delays() {
        let mut config = Config::default();
        config.retry_strategy.initial_delay = 10.0;
        config.retry_strategy.max_delay = 1.0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let mut config = Config::default();
        config.parallel_processing.max_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
