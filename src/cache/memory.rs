//! Memory Tier - Bounded Hot Cache
//!
//! Ordered map of key → entry with a byte budget. Order reflects insertion
//! and access recency: the front is the least recently touched entry.
//!
//! # Design
//!
//! - `HashMap` for O(1) lookup plus a `BTreeMap<seq, key>` for order;
//!   a hit moves the entry to the back by giving it a fresh sequence number
//! - Eviction runs inside `insert` until the new entry fits the budget
//! - Not synchronized; the tiered cache wraps it in a single mutex

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use super::entry::CacheEntry;
use super::policy::{Candidate, EvictionPolicy};

/// Result of a memory lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<V> {
    /// Live entry
    Hit(V),
    /// Entry was present but expired; it has been removed
    Expired,
    /// No entry
    Miss,
}

/// Result of an insert
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Whether the entry is now resident
    pub admitted: bool,
    /// Keys evicted to make room
    pub evicted: Vec<String>,
}

struct Slot<V> {
    entry: CacheEntry<V>,
    size: u64,
    seq: u64,
}

/// Memory tier statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTierStats {
    /// Estimated bytes resident
    pub size_bytes: u64,
    /// Byte budget
    pub capacity_bytes: u64,
    /// Resident entries
    pub entries: usize,
    /// size / capacity (0.0 - 1.0)
    pub utilization: f64,
    /// Resident entries already past their TTL
    pub expired_entries: usize,
    /// Sum of access counts of resident entries
    pub total_accesses: u64,
}

/// Bounded in-memory tier
pub struct MemoryTier<V> {
    slots: HashMap<String, Slot<V>>,
    order: BTreeMap<u64, String>,
    next_seq: u64,
    size: u64,
    budget: u64,
    policy: Box<dyn EvictionPolicy>,
}

impl<V: Clone> MemoryTier<V> {
    /// Create an empty tier with a byte budget
    pub fn new(budget: u64, policy: Box<dyn EvictionPolicy>) -> Self {
        Self {
            slots: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            size: 0,
            budget,
            policy,
        }
    }

    /// Look up `key`, recording the hit and moving it to the back
    pub fn get(&mut self, key: &str, now: DateTime<Utc>) -> Lookup<V> {
        let expired = match self.slots.get(key) {
            None => return Lookup::Miss,
            Some(slot) => slot.entry.is_expired(now),
        };

        if expired {
            self.remove(key);
            return Lookup::Expired;
        }

        let seq = self.bump_seq();
        match self.slots.get_mut(key) {
            Some(slot) => {
                self.order.remove(&slot.seq);
                slot.seq = seq;
                self.order.insert(seq, key.to_string());
                slot.entry.record_access(now);
                Lookup::Hit(slot.entry.value.clone())
            }
            None => Lookup::Miss,
        }
    }

    /// Insert or overwrite an entry, evicting until it fits
    ///
    /// An entry larger than the whole budget is not admitted.
    pub fn insert(&mut self, entry: CacheEntry<V>, size: u64, now: DateTime<Utc>) -> InsertOutcome {
        let mut outcome = InsertOutcome::default();
        self.remove(&entry.key);

        if size > self.budget {
            return outcome;
        }

        while self.size + size > self.budget {
            let victim = {
                let mut candidates = self.candidates();
                self.policy
                    .select_victim(&mut candidates, now)
                    .map(str::to_string)
            };
            match victim {
                Some(key) => {
                    self.remove(&key);
                    outcome.evicted.push(key);
                }
                None => break,
            }
        }

        let seq = self.bump_seq();
        let key = entry.key.clone();
        self.order.insert(seq, key.clone());
        self.slots.insert(key, Slot { entry, size, seq });
        self.size += size;
        outcome.admitted = true;
        outcome
    }

    /// Remove an entry
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.seq);
        self.size -= slot.size;
        Some(slot.entry)
    }

    /// Remove every expired entry and return how many were dropped
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    /// Whether a live entry exists for `key` (does not count as a hit)
    pub fn contains_live(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.slots
            .get(key)
            .map(|slot| !slot.entry.is_expired(now))
            .unwrap_or(false)
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.slots.clear();
        self.order.clear();
        self.size = 0;
    }

    /// Estimated bytes resident
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Byte budget
    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Number of resident entries
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if the tier is empty
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Keys from least to most recently touched
    pub fn keys_in_order(&self) -> Vec<String> {
        self.order.values().cloned().collect()
    }

    /// Access count of a resident entry
    pub fn access_count(&self, key: &str) -> Option<u64> {
        self.slots.get(key).map(|slot| slot.entry.access_count)
    }

    /// Utilization (0.0 - 1.0)
    pub fn utilization(&self) -> f64 {
        if self.budget == 0 {
            return 0.0;
        }
        self.size as f64 / self.budget as f64
    }

    /// Tier statistics
    pub fn stats(&self, now: DateTime<Utc>) -> MemoryTierStats {
        let mut expired_entries = 0;
        let mut total_accesses = 0;
        for slot in self.slots.values() {
            if slot.entry.is_expired(now) {
                expired_entries += 1;
            }
            total_accesses += slot.entry.access_count;
        }
        MemoryTierStats {
            size_bytes: self.size,
            capacity_bytes: self.budget,
            entries: self.slots.len(),
            utilization: self.utilization(),
            expired_entries,
            total_accesses,
        }
    }

    fn candidates(&self) -> impl Iterator<Item = Candidate<'_>> {
        self.order.values().filter_map(move |key| {
            self.slots.get(key).map(|slot| Candidate {
                key: key.as_str(),
                access_count: slot.entry.access_count,
                last_accessed_at: slot.entry.last_accessed_at,
            })
        })
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

// =============================================================================
// Tests
// =============================================================================
