//! Disk Tier - Cold Storage
//!
//! One file per key under the configured directory:
//!
//! ```text
//! <disk_path>/<hex(sha256(key))>.cache   JSON PersistedEntry
//! ```
//!
//! # Design
//!
//! - All methods are synchronous and block; callers run them on the
//!   [`WorkerPool`](crate::pool::WorkerPool)
//! - Writes go to a temp file first and are renamed into place, so a reader
//!   never sees a half-written entry
//! - No in-process lock: the filesystem is the only arbiter

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::entry::PersistedEntry;
use crate::error::{Error, Result};

/// Extension of cache files
pub const CACHE_FILE_EXTENSION: &str = "cache";

/// Result of reading one key
#[derive(Debug, Clone, PartialEq)]
pub enum DiskRead<V> {
    /// File decoded
    Found(PersistedEntry<V>),
    /// No file
    Missing,
    /// File exists but cannot be decoded; it has been deleted
    Corrupt(String),
}

/// Disk statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskTierStats {
    /// Total bytes of `*.cache` files
    pub size_bytes: u64,
    /// Number of `*.cache` files
    pub entries: usize,
}

/// Outcome of a directory sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskSweep {
    /// Files inspected
    pub scanned: usize,
    /// Expired files deleted
    pub expired: usize,
    /// Undecodable files deleted
    pub corrupt: usize,
    /// Files that could not be read or deleted
    pub failed: usize,
}

/// File-backed tier
#[derive(Debug)]
pub struct DiskTier {
    dir: PathBuf,
    tmp_counter: AtomicU64,
}

impl DiskTier {
    /// Create a tier rooted at `dir` (the directory is created by [`ensure_dir`](Self::ensure_dir))
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            tmp_counter: AtomicU64::new(0),
        }
    }

    /// Root directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory if needed and make sure it is a directory
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let meta = fs::metadata(&self.dir)?;
        if !meta.is_dir() {
            return Err(Error::Config(format!(
                "cache.disk_path {} is not a directory",
                self.dir.display()
            )));
        }
        Ok(())
    }

    /// File that holds `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir
            .join(format!("{}.{}", hex::encode(digest), CACHE_FILE_EXTENSION))
    }

    /// Read and decode the entry for `key`
    ///
    /// Undecodable files, and files whose stored key does not match, are
    /// deleted and reported as [`DiskRead::Corrupt`].
    pub fn read<V: DeserializeOwned>(&self, key: &str) -> Result<DiskRead<V>> {
        let path = self.path_for(key);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(DiskRead::Missing),
            Err(e) => return Err(e.into()),
        };

        let reason = match serde_json::from_slice::<PersistedEntry<V>>(&raw) {
            Ok(entry) if entry.key == key => return Ok(DiskRead::Found(entry)),
            Ok(entry) => format!("stored key {:?} does not match", entry.key),
            Err(e) => e.to_string(),
        };

        remove_quietly(&path)?;
        Ok(DiskRead::Corrupt(reason))
    }

    /// Persist an entry, replacing any previous file
    pub fn write<V: Serialize>(&self, entry: &PersistedEntry<V>) -> Result<()> {
        let path = self.path_for(&entry.key);
        let bytes = serde_json::to_vec(entry)?;

        let seq = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("tmp{}", seq));
        fs::write(&tmp, &bytes)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Delete the file for `key`; `true` if one existed
    pub fn remove(&self, key: &str) -> Result<bool> {
        remove_quietly(&self.path_for(key))
    }

    /// Delete every expired or undecodable `*.cache` file
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<DiskSweep> {
        let mut report = DiskSweep::default();

        for path in self.cache_files()? {
            report.scanned += 1;
            let raw = match fs::read(&path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read cache file");
                    report.failed += 1;
                    continue;
                }
            };

            let stale = match serde_json::from_slice::<PersistedEntry<IgnoredAny>>(&raw) {
                Ok(entry) if entry.is_expired(now) => Some(false),
                Ok(_) => None,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Corrupt cache file");
                    Some(true)
                }
            };

            if let Some(corrupt) = stale {
                match remove_quietly(&path) {
                    Ok(_) if corrupt => report.corrupt += 1,
                    Ok(_) => report.expired += 1,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to delete cache file");
                        report.failed += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    /// File count and total size
    pub fn stats(&self) -> Result<DiskTierStats> {
        let mut stats = DiskTierStats::default();
        for path in self.cache_files()? {
            match fs::metadata(&path) {
                Ok(meta) => {
                    stats.entries += 1;
                    stats.size_bytes += meta.len();
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(stats)
    }

    /// Delete every `*.cache` file and return how many were removed
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.cache_files()? {
            if remove_quietly(&path)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn cache_files(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(CACHE_FILE_EXTENSION) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

fn remove_quietly(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::CacheEntry;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn persisted(key: &str, value: &str, ttl_secs: u64) -> PersistedEntry<String> {
        CacheEntry::new(key, value.to_string(), Duration::from_secs(ttl_secs), at(0)).to_persisted()
    }

    fn tier() -> (tempfile::TempDir, DiskTier) {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::new(dir.path().join("cache"));
        tier.ensure_dir().unwrap();
        (dir, tier)
    }

    #[test]
    fn test_path_is_hashed_key() {
        let tier = DiskTier::new("/tmp/x");
        let path = tier.path_for("hello");
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824.cache"
        );
        assert_eq!(tier.path_for("hello"), path);
        assert_ne!(tier.path_for("hello2"), path);
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, tier) = tier();
        tier.write(&persisted("k", "v", 60)).unwrap();
        assert_matches!(tier.read::<String>("k").unwrap(), DiskRead::Found(e) if e.value == "v");
        assert_matches!(tier.read::<String>("other").unwrap(), DiskRead::Missing);
    }

    #[test]
    fn test_corrupt_file_is_deleted() {
        let (_dir, tier) = tier();
        let path = tier.path_for("k");
        fs::write(&path, b"{ not json").unwrap();
        assert_matches!(tier.read::<String>("k").unwrap(), DiskRead::Corrupt(_));
        assert!(!path.exists());
    }

    #[test]
    fn test_wrong_value_type_is_corrupt() {
        let (_dir, tier) = tier();
        tier.write(&persisted("k", "text", 60)).unwrap();
        assert_matches!(tier.read::<u64>("k").unwrap(), DiskRead::Corrupt(_));
    }

    #[test]
    fn test_sweep_removes_expired_and_corrupt() {
        let (_dir, tier) = tier();
        tier.write(&persisted("short", "a", 5)).unwrap();
        tier.write(&persisted("long", "b", 500)).unwrap();
        fs::write(tier.path_for("junk"), b"garbage").unwrap();
        fs::write(tier.dir().join("notes.txt"), b"ignored").unwrap();

        let report = tier.sweep(at(10)).unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.expired, 1);
        assert_eq!(report.corrupt, 1);
        assert_eq!(report.failed, 0);

        assert!(!tier.path_for("short").exists());
        assert!(tier.path_for("long").exists());
        assert!(tier.dir().join("notes.txt").exists());
    }

    #[test]
    fn test_stats_and_clear() {
        let (_dir, tier) = tier();
        tier.write(&persisted("a", "1", 60)).unwrap();
        tier.write(&persisted("b", "2", 60)).unwrap();
        let stats = tier.stats().unwrap();
        assert_eq!(stats.entries, 2);
        assert!(stats.size_bytes > 0);

        assert_eq!(tier.clear().unwrap(), 2);
        assert_eq!(tier.stats().unwrap(), DiskTierStats::default());
    }

    #[test]
    fn test_remove() {
        let (_dir, tier) = tier();
        tier.write(&persisted("a", "1", 60)).unwrap();
        assert!(tier.remove("a").unwrap());
        assert!(!tier.remove("a").unwrap());
    }

    #[test]
    fn test_ensure_dir_rejects_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        fs::write(&file, b"x").unwrap();
        let tier = DiskTier::new(&file);
        assert!(tier.ensure_dir().is_err());
    }

    #[test]
    fn test_missing_dir_has_no_files() {
        let tier = DiskTier::new("/definitely/not/a/cache/dir");
        assert_eq!(tier.stats().unwrap(), DiskTierStats::default());
    }
}
