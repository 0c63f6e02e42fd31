//! Memory Tier Eviction Policies
//!
//! The strategy is chosen once when the cache is built; eviction code only
//! talks to the [`EvictionPolicy`] trait.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::elapsed_between;

/// Strategy names accepted in configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    /// Least recently inserted or accessed
    Lru,
    /// Oldest in the ordered map
    Fifo,
    /// Lowest frequency-over-idle-time score
    #[default]
    Adaptive,
}

impl EvictionStrategy {
    /// Build the policy implementation for this strategy
    pub fn build(self) -> Box<dyn EvictionPolicy> {
        match self {
            EvictionStrategy::Lru => Box::new(LruPolicy),
            EvictionStrategy::Fifo => Box::new(FifoPolicy),
            EvictionStrategy::Adaptive => Box::new(AdaptivePolicy),
        }
    }
}

impl std::fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionStrategy::Lru => write!(f, "lru"),
            EvictionStrategy::Fifo => write!(f, "fifo"),
            EvictionStrategy::Adaptive => write!(f, "adaptive"),
        }
    }
}

impl FromStr for EvictionStrategy {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionStrategy::Lru),
            "fifo" => Ok(EvictionStrategy::Fifo),
            "adaptive" => Ok(EvictionStrategy::Adaptive),
            other => Err(crate::error::Error::Config(format!(
                "unknown cache strategy: {}",
                other
            ))),
        }
    }
}

/// What a policy sees of a resident entry
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub key: &'a str,
    pub access_count: u64,
    pub last_accessed_at: DateTime<Utc>,
}

/// Picks the next entry to evict
///
/// `candidates` yields resident entries from least to most recently
/// inserted/accessed.
pub trait EvictionPolicy: Send + Sync + std::fmt::Debug {
    /// Policy name for logs
    fn name(&self) -> &'static str;

    /// Key of the entry to evict, `None` when nothing is resident
    fn select_victim<'a>(
        &self,
        candidates: &mut dyn Iterator<Item = Candidate<'a>>,
        now: DateTime<Utc>,
    ) -> Option<&'a str>;
}

/// Evicts the front of the ordered map
#[derive(Debug, Clone, Copy, Default)]
pub struct LruPolicy;

impl EvictionPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn select_victim<'a>(
        &self,
        candidates: &mut dyn Iterator<Item = Candidate<'a>>,
        _now: DateTime<Utc>,
    ) -> Option<&'a str> {
        candidates.next().map(|c| c.key)
    }
}

/// Evicts the oldest entry in map order
///
/// Hits move entries to the back of the map, so this behaves like
/// [`LruPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoPolicy;

impl EvictionPolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn select_victim<'a>(
        &self,
        candidates: &mut dyn Iterator<Item = Candidate<'a>>,
        _now: DateTime<Utc>,
    ) -> Option<&'a str> {
        candidates.next().map(|c| c.key)
    }
}

/// Evicts the entry with the lowest `access_count / (idle_secs + 1)`
///
/// Idle time is measured in seconds as `f64`. On equal scores the older
/// entry goes first.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptivePolicy;

impl AdaptivePolicy {
    /// Score of one candidate; higher means more worth keeping
    pub fn score(access_count: u64, last_accessed_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let idle_secs = elapsed_between(last_accessed_at, now).as_secs_f64();
        access_count as f64 / (idle_secs + 1.0)
    }
}

impl EvictionPolicy for AdaptivePolicy {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn select_victim<'a>(
        &self,
        candidates: &mut dyn Iterator<Item = Candidate<'a>>,
        now: DateTime<Utc>,
    ) -> Option<&'a str> {
        let mut victim: Option<(&'a str, f64)> = None;
        for candidate in candidates {
            let score = Self::score(candidate.access_count, candidate.last_accessed_at, now);
            match victim {
                Some((_, best)) if score >= best => {}
                _ => victim = Some((candidate.key, score)),
            }
        }
        victim.map(|(key, _)| key)
    }
}

// =============================================================================
// Tests
// =============================================================================
