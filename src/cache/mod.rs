//! Two-Tier Cache
//!
//! Bounded memory tier in front of an unbounded disk tier, with per-entry
//! TTL and asynchronous write-through.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        TieredCache                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Memory Tier                  │  Disk Tier                   │
//! │  ┌─────────────────────────┐  │  ┌────────────────────────┐  │
//! │  │ ordered map + byte      │  │  │ <dir>/<sha256>.cache   │  │
//! │  │ budget, pluggable       │  │  │ JSON, one file per key │  │
//! │  │ eviction policy         │  │  │ worker-pool I/O        │  │
//! │  └─────────────────────────┘  │  └────────────────────────┘  │
//! │              │                │              │               │
//! │              └──── promotion on disk hit ────┘               │
//! │                                                              │
//! │               Background sweep (cleanup_interval)            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - TTL is measured from the original `set`; promotion does not renew it
//! - Memory size never exceeds the budget after a mutation
//! - Disk failures degrade to misses and are never returned to callers

mod disk;
mod entry;
mod manager;
mod memory;
mod metrics;
mod pending;
mod policy;
mod proptest;

pub use disk::{DiskRead, DiskSweep, DiskTier, DiskTierStats, CACHE_FILE_EXTENSION};
pub use entry::{estimate_size, CacheEntry, CacheValue, PersistedEntry};
pub use manager::{
    BatchPreloadReport, CacheStats, PreloadItem, PreloadOutcome, SweepReport, TieredCache,
};
pub use memory::{InsertOutcome, Lookup, MemoryTier, MemoryTierStats};
pub use metrics::{CacheMetrics, CacheMetricsSnapshot};
pub use policy::{
    AdaptivePolicy, Candidate, EvictionPolicy, EvictionStrategy, FifoPolicy, LruPolicy,
};

/// Size charged for a value that cannot be serialized
pub const DEFAULT_ENTRY_SIZE: u64 = 1024;
