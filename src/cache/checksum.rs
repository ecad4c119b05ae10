//! Persisted tag invalidation counters.
//!
//! Every tag has a counter that only ever grows. Items record the counters
//! of their tags when written; an item is stale as soon as any of those
//! counters has moved on. A single bin-wide epoch counter works the same way
//! for "invalidate everything".
//!
//! # Layout
//!
//! ```text
//! <bin>/.checksums/epoch          bin epoch
//! <bin>/.checksums/tags/<name>    one counter per tag (normalized name)
//! <bin>/.checksums/lock           held while counters are updated
//! ```
//!
//! Reads are lock-free; counter files are replaced atomically. Updates hold
//! the registry lock so concurrent increments are never lost.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::atomic::{read_if_exists, write_atomic};
use super::error::{StorageError, StorageResult};
use super::item::{CacheItem, TagSnapshot};
use super::lock::RegistryLock;
use crate::key::normalize;

/// Directory holding the registry inside a bin directory.
pub const REGISTRY_DIR: &str = ".checksums";

const TAGS_DIR: &str = "tags";
const EPOCH_FILE: &str = "epoch";
const LOCK_FILE: &str = "lock";
const EPOCH_NAME: &str = "@epoch";

/// Source of truth for tag and bin invalidation state.
///
/// [`FileCacheStore`](super::FileCacheStore) depends on this trait rather
/// than on the file-backed registry, so callers can share or replace it.
pub trait TagChecksum: Send + Sync + fmt::Debug {
    /// Current counters for `tags`. Unknown tags report 0.
    fn checksum(&self, tags: &[&str]) -> StorageResult<TagSnapshot>;

    /// Current bin epoch. 0 until the first `invalidate_all`.
    fn epoch(&self) -> StorageResult<u64>;

    /// Increment the counter of every tag in `tags`.
    fn invalidate(&self, tags: &[&str]) -> StorageResult<()>;

    /// Invalidate every item written so far.
    fn invalidate_all(&self) -> StorageResult<()>;

    /// Forget all state.
    fn reset(&self) -> StorageResult<()>;

    /// Whether no tag of `item` and not the bin epoch moved since it was
    /// written.
    fn is_current(&self, item: &CacheItem) -> StorageResult<bool> {
        if self.epoch()? != item.epoch {
            return Ok(false);
        }
        if item.tags.is_empty() {
            return Ok(true);
        }
        let names: Vec<&str> = item.tag_names().collect();
        Ok(self.checksum(&names)? == item.tags)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CounterRecord {
    name: String,
    counter: u64,
}

/// File-backed [`TagChecksum`] scoped to one bin.
#[derive(Debug, Clone)]
pub struct TagChecksumRegistry {
    root: PathBuf,
    lock_timeout: Duration,
    stale_lock_after: Duration,
}

impl TagChecksumRegistry {
    /// Registry stored in `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_timeout: Duration::from_secs(5),
            stale_lock_after: Duration::from_secs(30),
        }
    }

    /// Registry stored in the standard location inside `bin_dir`.
    #[must_use]
    pub fn for_bin(bin_dir: &Path) -> Self {
        Self::new(bin_dir.join(REGISTRY_DIR))
    }

    /// Override lock wait and stale-lock thresholds.
    #[must_use]
    pub fn with_lock_timeouts(mut self, timeout: Duration, stale_after: Duration) -> Self {
        self.lock_timeout = timeout;
        self.stale_lock_after = stale_after;
        self
    }

    /// Registry directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tag_path(&self, tag: &str) -> PathBuf {
        self.root.join(TAGS_DIR).join(&*normalize(tag))
    }

    fn epoch_path(&self) -> PathBuf {
        self.root.join(EPOCH_FILE)
    }

    /// Read a counter. `None` if it was never written.
    fn read_counter(path: &Path, name: &str) -> StorageResult<Option<u64>> {
        let bytes = read_if_exists(path).map_err(|source| StorageError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let Some(bytes) = bytes else {
            return Ok(None);
        };
        match serde_json::from_slice::<CounterRecord>(&bytes) {
            Ok(record) if record.name == name => Ok(Some(record.counter)),
            _ => Err(StorageError::CorruptChecksum(path.to_path_buf())),
        }
    }

    fn write_counter(path: &Path, name: &str, counter: u64) -> StorageResult<()> {
        let record = CounterRecord {
            name: name.to_string(),
            counter,
        };
        write_atomic(path, &serde_json::to_vec(&record)?)
    }

    fn lock(&self) -> StorageResult<RegistryLock> {
        let tags_dir = self.root.join(TAGS_DIR);
        fs::create_dir_all(&tags_dir).map_err(|source| StorageError::CreateDir {
            path: tags_dir,
            source,
        })?;
        RegistryLock::acquire(
            &self.root.join(LOCK_FILE),
            self.lock_timeout,
            self.stale_lock_after,
        )
    }

    /// Bump the epoch. Caller holds the lock.
    fn bump_epoch_locked(&self) -> StorageResult<u64> {
        let path = self.epoch_path();
        let current = match Self::read_counter(&path, EPOCH_NAME) {
            Ok(value) => value.unwrap_or(0),
            Err(StorageError::CorruptChecksum(_)) => {
                // Restart above anything a reader could have cached.
                log::warn!("Corrupt epoch file {}, resetting", path.display());
                u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
            }
            Err(e) => return Err(e),
        };
        let next = current.saturating_add(1);
        Self::write_counter(&path, EPOCH_NAME, next)?;
        Ok(next)
    }
}

impl TagChecksum for TagChecksumRegistry {
    fn checksum(&self, tags: &[&str]) -> StorageResult<TagSnapshot> {
        let mut snapshot = TagSnapshot::new();
        for &tag in tags {
            if snapshot.contains_key(tag) {
                continue;
            }
            let counter = Self::read_counter(&self.tag_path(tag), tag)?.unwrap_or(0);
            snapshot.insert(tag.to_string(), counter);
        }
        Ok(snapshot)
    }

    fn epoch(&self) -> StorageResult<u64> {
        Ok(Self::read_counter(&self.epoch_path(), EPOCH_NAME)?.unwrap_or(0))
    }

    fn invalidate(&self, tags: &[&str]) -> StorageResult<()> {
        let unique: BTreeSet<&str> = tags.iter().copied().collect();
        if unique.is_empty() {
            return Ok(());
        }

        let _lock = self.lock()?;
        let mut lost_counter = false;

        for tag in unique {
            let path = self.tag_path(tag);
            let next = match Self::read_counter(&path, tag) {
                Ok(counter) => counter.unwrap_or(0).saturating_add(1),
                Err(StorageError::CorruptChecksum(_)) => {
                    log::warn!(
                        "Corrupt checksum for tag '{}' at {}, invalidating bin",
                        tag,
                        path.display()
                    );
                    lost_counter = true;
                    1
                }
                Err(e) => return Err(e),
            };
            Self::write_counter(&path, tag, next)?;
            log::trace!("Tag '{}' invalidated, counter now {}", tag, next);
        }

        // Items may hold any old value of a lost counter; only an epoch
        // bump is guaranteed to invalidate them.
        if lost_counter {
            self.bump_epoch_locked()?;
        }
        Ok(())
    }

    fn invalidate_all(&self) -> StorageResult<()> {
        let _lock = self.lock()?;
        let epoch = self.bump_epoch_locked()?;
        log::debug!("Bin epoch advanced to {} at {}", epoch, self.root.display());
        Ok(())
    }

    fn reset(&self) -> StorageResult<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Remove {
                path: self.root.clone(),
                source,
            }),
        }
    }
}
