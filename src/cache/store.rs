//! File-backed cache store for a single bin.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use walkdir::WalkDir;

use super::atomic::{
    fingerprint, read_if_exists, remove_if_exists, write_atomic, write_atomic_if, Fingerprint,
    TEMP_PREFIX,
};
use super::checksum::{TagChecksum, TagChecksumRegistry};
use super::codec;
use super::error::{BatchError, StorageError, StorageResult};
use super::gc::GcBudget;
use super::item::{CacheHit, CacheItem, Expiration, NewCacheItem};
use crate::key::{is_valid_name, normalize};

/// How often `remove_bin` retries when a concurrent writer repopulates the
/// directory while it is being removed.
const REMOVE_ATTEMPTS: usize = 3;

/// Tunables for a [`FileCacheStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Maximum wait for the checksum registry lock.
    pub lock_timeout: Duration,
    /// Age after which a registry lock is considered abandoned.
    pub stale_lock_after: Duration,
    /// Age after which a leftover temp file is removed by garbage collection.
    pub stale_temp_after: Duration,
    /// Work limit for a single [`FileCacheStore::garbage_collection`] call.
    pub gc_budget: GcBudget,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            stale_lock_after: Duration::from_secs(30),
            stale_temp_after: Duration::from_secs(3600),
            gc_budget: GcBudget::default(),
        }
    }
}

/// Kind of a directory entry in a bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum EntryKind {
    Item,
    Temp,
}

/// A file found in the bin directory.
#[derive(Debug, Clone)]
pub(super) struct BinEntry {
    pub(super) name: String,
    pub(super) path: PathBuf,
    pub(super) kind: EntryKind,
}

/// Counts describing the current contents of a bin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BinStats {
    /// Item files found
    pub items: usize,
    /// Items that a normal `get` would return
    pub valid: usize,
    /// Items past their expiration
    pub expired: usize,
    /// Items invalidated by tag or bin invalidation
    pub invalidated: usize,
    /// Item files that could not be decoded
    pub corrupt: usize,
    /// In-flight or abandoned temp files
    pub temp_files: usize,
    /// Total bytes of item files
    pub bytes: u64,
}

/// Cache store keeping one file per item in a bin directory.
///
/// All operations are safe to run from several threads and processes
/// against the same directory. Writes are atomic renames, reads are
/// lock-free, and only tag counter updates take a (short-lived) lock.
///
/// # Example
///
/// ```no_run
/// use filecache::cache::{Expiration, FileCacheStore, StoreOptions};
///
/// let store = FileCacheStore::new("render", "/tmp/cache/render", StoreOptions::default());
/// store.set("page:1", "<html>", Expiration::Permanent, &["node:5"])?;
///
/// assert!(store.get("page:1", false).is_some());
/// store.invalidate_tags(&["node:5"])?;
/// assert!(store.get("page:1", false).is_none());
/// assert!(store.get("page:1", true).is_some());
/// # Ok::<(), filecache::cache::StorageError>(())
/// ```
#[derive(Debug)]
pub struct FileCacheStore {
    bin: String,
    pub(super) dir: PathBuf,
    pub(super) checksums: Arc<dyn TagChecksum>,
    pub(super) options: StoreOptions,
}

impl FileCacheStore {
    /// Store for `bin` in `dir`, with the checksum registry kept inside
    /// `dir`.
    pub fn new(bin: impl Into<String>, dir: impl Into<PathBuf>, options: StoreOptions) -> Self {
        let dir = dir.into();
        let registry = TagChecksumRegistry::for_bin(&dir)
            .with_lock_timeouts(options.lock_timeout, options.stale_lock_after);
        Self::with_checksums(bin, dir, options, Arc::new(registry))
    }

    /// Store using an externally provided checksum registry.
    pub fn with_checksums(
        bin: impl Into<String>,
        dir: impl Into<PathBuf>,
        options: StoreOptions,
        checksums: Arc<dyn TagChecksum>,
    ) -> Self {
        Self {
            bin: bin.into(),
            dir: dir.into(),
            checksums,
            options,
        }
    }

    /// Bin name.
    #[must_use]
    pub fn bin(&self) -> &str {
        &self.bin
    }

    /// Bin directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// The registry deciding tag validity.
    #[must_use]
    pub fn checksums(&self) -> &Arc<dyn TagChecksum> {
        &self.checksums
    }

    /// Store options.
    #[must_use]
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Path of the file backing `key`.
    #[must_use]
    pub fn item_path(&self, key: &str) -> PathBuf {
        self.dir.join(&*normalize(key))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Read and decode an item file. Absent, unreadable and corrupt files
    /// are all `None`.
    pub(super) fn read_item(&self, path: &Path) -> Option<CacheItem> {
        let bytes = match read_if_exists(path) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Failed to read cache file {}: {}", path.display(), e);
                return None;
            }
        };
        match codec::decode(&bytes) {
            Ok(item) => Some(item),
            Err(e) => {
                log::debug!("Ignoring corrupt cache file {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Whether `item` is neither expired nor invalidated.
    pub(super) fn is_valid_at(&self, item: &CacheItem, now: i64) -> bool {
        if item.expiration.is_expired_at(now) {
            return false;
        }
        match self.checksums.is_current(item) {
            Ok(current) => current,
            Err(e) => {
                log::warn!(
                    "Cannot verify tags of '{}' in bin '{}', treating as invalid: {}",
                    item.key,
                    self.bin,
                    e
                );
                false
            }
        }
    }

    /// Look up `key`.
    ///
    /// Returns `None` for a miss: no file, an undecodable file, or an
    /// expired/invalidated item when `allow_invalid` is false. With
    /// `allow_invalid`, stale items are returned with `valid == false`.
    #[must_use]
    pub fn get(&self, key: &str, allow_invalid: bool) -> Option<CacheHit> {
        let path = self.item_path(key);
        let item = self.read_item(&path)?;

        if item.key != key {
            log::debug!(
                "Cache file {} belongs to key '{}', not '{}'",
                path.display(),
                item.key,
                key
            );
            return None;
        }

        let valid = self.is_valid_at(&item, chrono::Utc::now().timestamp());
        if !valid && !allow_invalid {
            log::trace!("Cache miss (stale) for '{}' in bin '{}'", key, self.bin);
            return None;
        }
        Some(CacheHit { item, valid })
    }

    /// Look up several keys.
    ///
    /// Hits are returned by key; on return `keys` only contains the keys
    /// that missed, in their original order.
    pub fn get_multiple(
        &self,
        keys: &mut Vec<String>,
        allow_invalid: bool,
    ) -> HashMap<String, CacheHit> {
        let mut hits = HashMap::with_capacity(keys.len());
        for key in keys.iter() {
            if hits.contains_key(key) {
                continue;
            }
            if let Some(hit) = self.get(key, allow_invalid) {
                hits.insert(key.clone(), hit);
            }
        }
        keys.retain(|key| !hits.contains_key(key));
        hits
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Create the bin directory if needed and check that it is writable.
    fn ensure_dir(&self) -> StorageResult<()> {
        if !self.dir.is_dir() {
            fs::create_dir_all(&self.dir).map_err(|source| {
                if source.kind() == io::ErrorKind::PermissionDenied {
                    StorageError::NotWritable(self.dir.clone())
                } else {
                    StorageError::CreateDir {
                        path: self.dir.clone(),
                        source,
                    }
                }
            })?;
            log::debug!("Created cache directory {}", self.dir.display());
        }

        let readonly = fs::metadata(&self.dir)
            .map(|m| m.permissions().readonly())
            .map_err(|source| StorageError::CreateDir {
                path: self.dir.clone(),
                source,
            })?;
        if readonly {
            return Err(StorageError::NotWritable(self.dir.clone()));
        }
        Ok(())
    }

    fn write_item(&self, item: &CacheItem) -> StorageResult<()> {
        let bytes = codec::encode(item)?;
        write_atomic(&self.item_path(&item.key), &bytes)
    }

    /// Write `item` unless its file no longer matches `seen`.
    ///
    /// Returns whether the item was written. The check runs after the new
    /// contents are staged, so only the rename itself can race.
    pub(super) fn write_item_if_unchanged(
        &self,
        item: &CacheItem,
        seen: Fingerprint,
    ) -> StorageResult<bool> {
        let path = self.item_path(&item.key);
        let bytes = codec::encode(item)?;
        write_atomic_if(&path, &bytes, || {
            matches!(fingerprint(&path), Ok(Some(current)) if current == seen)
        })
    }

    /// Store `payload` under `key`.
    ///
    /// The current counters of `tags` and the bin epoch are recorded with
    /// the item; a later invalidation of any of them makes it stale.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the directory cannot be created or the
    /// item cannot be written.
    pub fn set(
        &self,
        key: &str,
        payload: impl Into<Vec<u8>>,
        expiration: Expiration,
        tags: &[&str],
    ) -> StorageResult<()> {
        self.ensure_dir()?;
        let snapshot = self.checksums.checksum(tags)?;
        let epoch = self.checksums.epoch()?;
        let item = CacheItem::new(key, payload, expiration, snapshot, epoch);
        self.write_item(&item)?;
        log::trace!("Stored '{}' in bin '{}'", key, self.bin);
        Ok(())
    }

    /// Store several items. A failing item does not stop the others.
    ///
    /// # Errors
    ///
    /// Returns a [`BatchError`] listing every key that could not be stored.
    pub fn set_multiple<I>(&self, items: I) -> Result<(), BatchError>
    where
        I: IntoIterator<Item = NewCacheItem>,
    {
        let mut attempted = 0;
        let mut failures = Vec::new();
        for item in items {
            attempted += 1;
            let tags: Vec<&str> = item.tags.iter().map(String::as_str).collect();
            if let Err(e) = self.set(&item.key, item.payload, item.expiration, &tags) {
                log::warn!("Failed to store '{}' in bin '{}': {}", item.key, self.bin, e);
                failures.push((item.key, e));
            }
        }
        BatchError::check(attempted, failures)
    }

    /// Run `op` for every key, collecting failures.
    fn for_each_key<I, S, F>(&self, keys: I, op: F) -> Result<(), BatchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&str) -> StorageResult<()>,
    {
        let mut attempted = 0;
        let mut failures = Vec::new();
        for key in keys {
            attempted += 1;
            let key = key.as_ref();
            if let Err(e) = op(key) {
                failures.push((key.to_string(), e));
            }
        }
        BatchError::check(attempted, failures)
    }

    // ------------------------------------------------------------------
    // Deletion and invalidation
    // ------------------------------------------------------------------

    /// Remove `key`. Removing an absent key succeeds.
    pub fn delete(&self, key: &str) -> StorageResult<()> {
        if remove_if_exists(&self.item_path(key))? {
            log::trace!("Deleted '{}' from bin '{}'", key, self.bin);
        }
        Ok(())
    }

    /// Remove several keys.
    pub fn delete_multiple<I, S>(&self, keys: I) -> Result<(), BatchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.for_each_key(keys, |key| self.delete(key))
    }

    /// Remove every item in the bin. Tag counters are kept.
    ///
    /// A file that cannot be removed does not stop the others.
    ///
    /// Returns the number of files removed.
    ///
    /// # Errors
    ///
    /// [`StorageError::Incomplete`] listing the files left behind, or the
    /// error that prevented listing the bin.
    pub fn delete_all(&self) -> StorageResult<usize> {
        let items = self
            .entries()?
            .into_iter()
            .filter(|entry| entry.kind == EntryKind::Item);
        let removed = self.remove_entries(items)?;
        self.save_gc_cursor(None);
        log::debug!("Deleted {} items from bin '{}'", removed, self.bin);
        Ok(removed)
    }

    fn remove_entries<I>(&self, entries: I) -> StorageResult<usize>
    where
        I: IntoIterator<Item = BinEntry>,
    {
        let mut attempted = 0;
        let mut removed = 0;
        let mut failures = Vec::new();
        for entry in entries {
            attempted += 1;
            match remove_if_exists(&entry.path) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    log::warn!("Failed to delete {} in bin '{}': {}", entry.name, self.bin, e);
                    failures.push((entry.name, e));
                }
            }
        }
        BatchError::check(attempted, failures)?;
        Ok(removed)
    }

    /// Remove every item and reset the checksum registry.
    ///
    /// If some items could not be removed the registry is kept and the
    /// bin epoch is advanced instead, so the leftovers stay stale.
    pub fn wipe(&self) -> StorageResult<usize> {
        let deleted = self.delete_all();
        self.finish_wipe(deleted)
    }

    fn finish_wipe(&self, deleted: StorageResult<usize>) -> StorageResult<usize> {
        match deleted {
            Ok(removed) => {
                self.checksums.reset()?;
                Ok(removed)
            }
            Err(e) => {
                // A reset would restart counters that leftover items may
                // still match.
                self.checksums.invalidate_all()?;
                Err(e)
            }
        }
    }

    /// Mark `key` stale without deleting it.
    ///
    /// The item is rewritten with an expiration in the past, so `get` only
    /// returns it when invalid items are allowed. Absent keys are ignored.
    ///
    /// If the item is rewritten while being invalidated the newer version
    /// is kept as is.
    pub fn invalidate(&self, key: &str) -> StorageResult<()> {
        let path = self.item_path(key);
        let seen = match fingerprint(&path) {
            Ok(Some(seen)) => seen,
            Ok(None) => return Ok(()),
            Err(source) => return Err(StorageError::Read { path, source }),
        };
        let Some(mut item) = self.read_item(&path) else {
            return Ok(());
        };
        if item.key != key {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp();
        if item.expiration.is_expired_at(now) {
            return Ok(());
        }
        item.expiration = Expiration::At(now - 1);
        if self.write_item_if_unchanged(&item, seen)? {
            log::trace!("Invalidated '{}' in bin '{}'", key, self.bin);
        } else {
            log::debug!(
                "'{}' in bin '{}' was rewritten during invalidation, keeping the new item",
                key,
                self.bin
            );
        }
        Ok(())
    }

    /// Mark several keys stale.
    pub fn invalidate_multiple<I, S>(&self, keys: I) -> Result<(), BatchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.for_each_key(keys, |key| self.invalidate(key))
    }

    /// Invalidate every item carrying any of `tags`.
    pub fn invalidate_tags(&self, tags: &[&str]) -> StorageResult<()> {
        self.checksums.invalidate(tags)
    }

    /// Invalidate every item in the bin.
    pub fn invalidate_all(&self) -> StorageResult<()> {
        self.checksums.invalidate_all()
    }

    /// Delete the bin directory and all checksum state.
    ///
    /// Succeeds when the bin does not exist.
    pub fn remove_bin(&self) -> StorageResult<()> {
        for attempt in 1..=REMOVE_ATTEMPTS {
            match fs::remove_dir_all(&self.dir) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) if attempt < REMOVE_ATTEMPTS => {
                    log::debug!(
                        "Retrying removal of {} (attempt {}): {}",
                        self.dir.display(),
                        attempt,
                        e
                    );
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(source) => {
                    return Err(StorageError::Remove {
                        path: self.dir.clone(),
                        source,
                    })
                }
            }
        }

        self.checksums.reset()?;
        log::info!("Removed cache bin '{}' at {}", self.bin, self.dir.display());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Directory scanning
    // ------------------------------------------------------------------

    /// Item and temp files in the bin, sorted by name.
    pub(super) fn entries(&self) -> StorageResult<Vec<BinEntry>> {
        let mut entries = Vec::new();
        self.scan(|entry| {
            entries.push(entry);
            ControlFlow::Continue(())
        })?;
        Ok(entries)
    }

    /// Feed item and temp files to `visit` in name order until it breaks.
    ///
    /// Only names are read up front; everything else happens per visited
    /// entry.
    pub(super) fn scan<F>(&self, mut visit: F) -> StorageResult<()>
    where
        F: FnMut(BinEntry) -> ControlFlow<()>,
    {
        let walker = WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name();

        for result in walker {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    if e.depth() == 0 {
                        if e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) {
                            return Ok(());
                        }
                        return Err(StorageError::Read {
                            path: self.dir.clone(),
                            source: e.into(),
                        });
                    }
                    log::debug!("Skipping unreadable entry in {}: {}", self.dir.display(), e);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            let kind = if is_valid_name(name) {
                EntryKind::Item
            } else if name.starts_with(TEMP_PREFIX) {
                EntryKind::Temp
            } else {
                continue;
            };
            let entry = BinEntry {
                name: name.to_string(),
                path: entry.path().to_path_buf(),
                kind,
            };
            if visit(entry).is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Summarize the bin contents.
    pub fn stats(&self) -> StorageResult<BinStats> {
        let mut stats = BinStats::default();
        let now = chrono::Utc::now().timestamp();

        for entry in self.entries()? {
            if entry.kind == EntryKind::Temp {
                stats.temp_files += 1;
                continue;
            }
            let Ok(meta) = fs::metadata(&entry.path) else {
                continue;
            };
            stats.items += 1;
            stats.bytes += meta.len();

            match self.read_item(&entry.path) {
                None => stats.corrupt += 1,
                Some(item) if item.expiration.is_expired_at(now) => stats.expired += 1,
                Some(item) if self.is_valid_at(&item, now) => stats.valid += 1,
                Some(_) => stats.invalidated += 1,
            }
        }
        Ok(stats)
    }
}
