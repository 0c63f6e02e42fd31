//! Pending Write-Throughs
//!
//! Values handed to the disk tier but not yet renamed into place. Reads
//! consult this table before the disk so an in-flight overwrite is never
//! shadowed by the older file. Writes of one key are serialized through a
//! striped lock and always persist the newest staged value, so files land
//! in `set` order.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use super::disk::DiskTier;
use super::entry::PersistedEntry;
use crate::error::Result;

const WRITE_STRIPES: usize = 64;

/// Outcome of one write-through attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    /// The newest staged value is on disk
    Written,
    /// Nothing left to write; a later attempt already persisted the key or
    /// it was discarded
    Superseded,
}

struct Staged<V> {
    seq: u64,
    entry: PersistedEntry<V>,
}

/// Newest not-yet-persisted entry per key
pub(crate) struct PendingWrites<V> {
    staged: Mutex<HashMap<String, Staged<V>>>,
    next_seq: AtomicU64,
    stripes: Vec<Mutex<()>>,
}

impl<V: Clone + Serialize> PendingWrites<V> {
    pub(crate) fn new() -> Self {
        Self {
            staged: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            stripes: (0..WRITE_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Record `entry` as the value the disk must end up with
    pub(crate) fn stage(&self, entry: PersistedEntry<V>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.staged
            .lock()
            .insert(entry.key.clone(), Staged { seq, entry });
    }

    /// Newest staged entry for `key`
    pub(crate) fn latest(&self, key: &str) -> Option<PersistedEntry<V>> {
        self.staged.lock().get(key).map(|s| s.entry.clone())
    }

    pub(crate) fn discard(&self, key: &str) {
        self.staged.lock().remove(key);
    }

    pub(crate) fn clear(&self) {
        self.staged.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.staged.lock().len()
    }

    /// Persist the newest staged value of `key`; blocking
    ///
    /// The staged value is dropped once written, or on failure, unless a
    /// newer one was staged meanwhile.
    pub(crate) fn write_latest(&self, key: &str, disk: &DiskTier) -> Result<WriteOutcome> {
        let _stripe = self.stripes[stripe_for(key)].lock();

        let Some((seq, entry)) = self
            .staged
            .lock()
            .get(key)
            .map(|s| (s.seq, s.entry.clone()))
        else {
            return Ok(WriteOutcome::Superseded);
        };

        let written = disk.write(&entry);

        let mut staged = self.staged.lock();
        if staged.get(key).is_some_and(|s| s.seq == seq) {
            staged.remove(key);
        }
        written.map(|()| WriteOutcome::Written)
    }
}

fn stripe_for(key: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % WRITE_STRIPES as u64) as usize
}

// =============================================================================
// Tests
// =============================================================================
