//! Garbage collection of expired, invalidated and corrupt cache files.
//!
//! Collection is incremental: each call stops once its [`GcBudget`] is used
//! up and records the last file it looked at in `.gc-cursor` inside the bin,
//! so the next call, from this or any other process, continues from there
//! instead of re-examining the same files. The budget is checked before
//! each file, while the bin is being walked.
//!
//! A file is removed when it
//! - cannot be decoded (or does not belong to its file name),
//! - has expired (permanent items never expire),
//! - carries a tag or bin epoch that was invalidated after it was written,
//! - is a temp file older than [`StoreOptions::stale_temp_after`].
//!
//! Before removing an item its size and modification time are checked
//! again; a file rewritten in the meantime is left alone.
//!
//! [`StoreOptions::stale_temp_after`]: super::StoreOptions::stale_temp_after

use std::fs;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;

use super::atomic::{
    fingerprint, read_if_exists, remove_if_exists, write_atomic, TEMP_PREFIX,
};
use super::codec;
use super::store::{BinEntry, EntryKind, FileCacheStore};
use super::StorageResult;
use crate::key::{is_valid_name, normalize};

/// File in the bin holding the name of the last file examined by an
/// unfinished collection. Neither an item nor a temp name.
const GC_CURSOR_FILE: &str = ".gc-cursor";

/// Limits for a single garbage collection call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcBudget {
    /// Maximum number of files examined (`None` = unlimited)
    pub max_items: Option<usize>,
    /// Maximum wall-clock time spent (`None` = unlimited)
    pub max_duration: Option<Duration>,
}

impl Default for GcBudget {
    fn default() -> Self {
        Self {
            max_items: Some(10_000),
            max_duration: Some(Duration::from_secs(2)),
        }
    }
}

impl GcBudget {
    /// No limits: examine the whole bin.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            max_items: None,
            max_duration: None,
        }
    }

    /// Limit by file count only.
    #[must_use]
    pub fn items(max_items: usize) -> Self {
        Self {
            max_items: Some(max_items),
            max_duration: None,
        }
    }

    fn exhausted(&self, examined: usize, started: Instant) -> bool {
        self.max_items.is_some_and(|max| examined >= max)
            || self.max_duration.is_some_and(|max| started.elapsed() >= max)
    }
}

/// Outcome of a garbage collection call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GcReport {
    /// Files examined
    pub scanned: usize,
    /// Expired items removed
    pub removed_expired: usize,
    /// Tag- or bin-invalidated items removed
    pub removed_invalidated: usize,
    /// Undecodable items removed
    pub removed_corrupt: usize,
    /// Stale temp files removed
    pub removed_temp: usize,
    /// Items left in place because they changed while being examined
    pub skipped_changed: usize,
    /// True if the end of the bin was reached within the budget
    pub complete: bool,
    /// Errors encountered (non-fatal)
    pub errors: Vec<String>,
}

impl GcReport {
    /// Total number of files removed.
    #[must_use]
    pub fn removed(&self) -> usize {
        self.removed_expired + self.removed_invalidated + self.removed_corrupt + self.removed_temp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Keep,
    Expired,
    Invalidated,
    Corrupt,
}

impl FileCacheStore {
    /// Collect garbage within the store's configured budget.
    ///
    /// # Errors
    ///
    /// Fails only if the bin directory cannot be listed. Problems with
    /// individual files are recorded in [`GcReport::errors`].
    pub fn garbage_collection(&self) -> StorageResult<GcReport> {
        let budget = self.options.gc_budget;
        self.garbage_collection_with(&budget)
    }

    /// Collect garbage within `budget`.
    pub fn garbage_collection_with(&self, budget: &GcBudget) -> StorageResult<GcReport> {
        let started = Instant::now();
        let mut report = GcReport::default();
        let resume_after = self.load_gc_cursor();
        let now = chrono::Utc::now().timestamp();
        let mut last_seen = None;
        let mut exhausted = false;

        self.scan(|entry| {
            if resume_after
                .as_deref()
                .is_some_and(|after| entry.name.as_str() <= after)
            {
                return ControlFlow::Continue(());
            }
            if budget.exhausted(report.scanned, started) {
                exhausted = true;
                return ControlFlow::Break(());
            }
            report.scanned += 1;

            match entry.kind {
                EntryKind::Temp => self.collect_temp(&entry, &mut report),
                EntryKind::Item => self.collect_item(&entry, now, &mut report),
            }
            last_seen = Some(entry.name);
            ControlFlow::Continue(())
        })?;

        if !exhausted {
            self.save_gc_cursor(None);
        } else if let Some(name) = &last_seen {
            self.save_gc_cursor(Some(name));
        }
        report.complete = !exhausted;

        log::info!(
            "GC of bin '{}': scanned {}, removed {} ({} expired, {} invalidated, {} corrupt, {} temp){}",
            self.bin(),
            report.scanned,
            report.removed(),
            report.removed_expired,
            report.removed_invalidated,
            report.removed_corrupt,
            report.removed_temp,
            if report.complete { "" } else { ", budget exhausted" }
        );
        Ok(report)
    }

    fn gc_cursor_path(&self) -> PathBuf {
        self.dir.join(GC_CURSOR_FILE)
    }

    /// Name after which the next collection starts, if one is pending.
    fn load_gc_cursor(&self) -> Option<String> {
        let path = self.gc_cursor_path();
        let bytes = match read_if_exists(&path) {
            Ok(bytes) => bytes?,
            Err(e) => {
                log::warn!("Failed to read GC cursor {}: {}", path.display(), e);
                return None;
            }
        };
        match String::from_utf8(bytes) {
            Ok(name) if is_valid_name(&name) || name.starts_with(TEMP_PREFIX) => Some(name),
            _ => {
                log::debug!("Ignoring malformed GC cursor {}", path.display());
                None
            }
        }
    }

    /// Record where the next collection starts; `None` starts over.
    pub(super) fn save_gc_cursor(&self, cursor: Option<&str>) {
        let path = self.gc_cursor_path();
        let result = match cursor {
            Some(name) => write_atomic(&path, name.as_bytes()),
            None => remove_if_exists(&path).map(|_| ()),
        };
        if let Err(e) = result {
            log::warn!("Failed to update GC cursor of bin '{}': {}", self.bin(), e);
        }
    }

    fn collect_temp(&self, entry: &BinEntry, report: &mut GcReport) {
        let age = fs::metadata(&entry.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok());

        if age.is_some_and(|age| age > self.options.stale_temp_after) {
            match remove_if_exists(&entry.path) {
                Ok(true) => {
                    log::debug!("Removed stale temp file {}", entry.path.display());
                    report.removed_temp += 1;
                }
                Ok(false) => {}
                Err(e) => report.errors.push(e.to_string()),
            }
        }
    }

    fn collect_item(&self, entry: &BinEntry, now: i64, report: &mut GcReport) {
        let before = match fingerprint(&entry.path) {
            Ok(Some(before)) => before,
            Ok(None) => return,
            Err(e) => {
                report
                    .errors
                    .push(format!("Failed to stat {}: {}", entry.path.display(), e));
                return;
            }
        };

        let bytes = match read_if_exists(&entry.path) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(e) => {
                report
                    .errors
                    .push(format!("Failed to read {}: {}", entry.path.display(), e));
                return;
            }
        };

        let verdict = match codec::decode(&bytes) {
            Err(e) => {
                log::debug!("GC: corrupt item {}: {}", entry.path.display(), e);
                Verdict::Corrupt
            }
            Ok(item) if normalize(&item.key) != entry.name.as_str() => Verdict::Corrupt,
            Ok(item) if item.expiration.is_expired_at(now) => Verdict::Expired,
            Ok(item) => match self.checksums.is_current(&item) {
                Ok(true) => Verdict::Keep,
                Ok(false) => Verdict::Invalidated,
                Err(e) => {
                    report.errors.push(format!(
                        "Cannot verify tags of {}: {}",
                        entry.path.display(),
                        e
                    ));
                    Verdict::Keep
                }
            },
        };

        if verdict == Verdict::Keep {
            return;
        }

        match fingerprint(&entry.path) {
            Ok(Some(current)) if current == before => {}
            Ok(Some(_)) => {
                report.skipped_changed += 1;
                return;
            }
            Ok(None) | Err(_) => return,
        }

        match remove_if_exists(&entry.path) {
            Ok(true) => {
                log::trace!("GC removed {} ({:?})", entry.path.display(), verdict);
                match verdict {
                    Verdict::Expired => report.removed_expired += 1,
                    Verdict::Invalidated => report.removed_invalidated += 1,
                    Verdict::Corrupt => report.removed_corrupt += 1,
                    Verdict::Keep => {}
                }
            }
            Ok(false) => {}
            Err(e) => report.errors.push(e.to_string()),
        }
    }
}
