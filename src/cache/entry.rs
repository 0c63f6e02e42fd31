//! Cache Entry Types
//!
//! In-memory entries carry access bookkeeping; the persisted form written to
//! the disk tier keeps only what is needed to decide expiry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::DEFAULT_ENTRY_SIZE;
use crate::clock::elapsed_between;

/// Values the tiered cache can hold
///
/// Anything cloneable and serde-serializable qualifies.
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// A cached value with TTL and access metadata
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    /// Unique key
    pub key: String,
    /// Cached payload
    pub value: V,
    /// Time to live, measured from `created_at`
    pub ttl: Duration,
    /// When the value was stored
    pub created_at: DateTime<Utc>,
    /// Last `get` hit (or creation)
    pub last_accessed_at: DateTime<Utc>,
    /// Number of `get` hits
    pub access_count: u64,
}

impl<V> CacheEntry<V> {
    /// Create a fresh entry
    pub fn new(key: impl Into<String>, value: V, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            value,
            ttl,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
        }
    }

    /// An entry is expired once strictly more than `ttl` has passed
    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        elapsed_between(self.created_at, now) > self.ttl
    }

    /// Record a hit and return the new count
    #[inline]
    pub fn record_access(&mut self, now: DateTime<Utc>) -> u64 {
        self.last_accessed_at = now;
        self.access_count += 1;
        self.access_count
    }

    /// Time since the last hit
    #[inline]
    pub fn idle_time(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.last_accessed_at, now)
    }
}

impl<V: Clone> CacheEntry<V> {
    /// Disk representation of this entry
    pub fn to_persisted(&self) -> PersistedEntry<V> {
        PersistedEntry {
            key: self.key.clone(),
            value: self.value.clone(),
            ttl_ms: duration_to_ms(self.ttl),
            created_at: self.created_at,
        }
    }
}

/// Serialized form of an entry in the disk tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry<V> {
    pub key: String,
    pub value: V,
    pub ttl_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl<V> PersistedEntry<V> {
    /// Time to live
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Same expiry rule as [`CacheEntry::is_expired`]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        elapsed_between(self.created_at, now) > self.ttl()
    }

    /// Rebuild an in-memory entry, keeping the original creation time
    pub fn into_entry(self, now: DateTime<Utc>) -> CacheEntry<V> {
        let ttl = self.ttl();
        CacheEntry {
            key: self.key,
            value: self.value,
            ttl,
            created_at: self.created_at,
            last_accessed_at: now,
            access_count: 0,
        }
    }
}

/// Estimated footprint of a value in the memory tier
///
/// Uses the length of its JSON encoding and falls back to
/// [`DEFAULT_ENTRY_SIZE`] when the value cannot be serialized.
pub fn estimate_size<V: Serialize>(value: &V) -> u64 {
    match serde_json::to_vec(value) {
        Ok(bytes) => bytes.len() as u64,
        Err(_) => DEFAULT_ENTRY_SIZE,
    }
}

fn duration_to_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// =============================================================================
// Tests
// =============================================================================
