//! Lock file serializing checksum registry updates.
//!
//! The lock is a file created with `create_new`, so exactly one process or
//! thread can hold it. It contains a token unique to the holder. Waiters
//! poll until a timeout. A lock older than the stale threshold is assumed to
//! belong to a crashed holder and is broken. Contention longer than half a
//! second is logged as a warning.
//!
//! Breaking renames the lock aside and checks that the renamed file is still
//! the one judged stale; a fresh lock taken in between is put back. A holder
//! only removes the lock file on release while it still carries its token.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::error::StorageError;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const CONTENTION_WARN_AFTER: Duration = Duration::from_millis(500);

/// Held registry lock. Released on drop.
#[derive(Debug)]
pub struct RegistryLock {
    path: PathBuf,
    token: String,
}

/// Contents and mtime of a lock file, identifying one holder.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Holder {
    token: String,
    modified: SystemTime,
}

impl Holder {
    fn read(path: &Path) -> Option<Self> {
        let token = fs::read_to_string(path).ok()?;
        let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
        Some(Self { token, modified })
    }
}

/// Token unique to one acquisition: pid, clock and a process-wide sequence.
fn new_token() -> String {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    format!(
        "{}-{}-{}",
        std::process::id(),
        nanos,
        SEQUENCE.fetch_add(1, Ordering::Relaxed)
    )
}

impl RegistryLock {
    /// Acquire the lock at `path`.
    ///
    /// The parent directory must exist.
    ///
    /// # Errors
    ///
    /// * [`StorageError::LockTimeout`] if the lock stays held past `timeout`
    /// * [`StorageError::Write`] for other I/O failures
    pub fn acquire(
        path: &Path,
        timeout: Duration,
        stale_after: Duration,
    ) -> Result<Self, StorageError> {
        let start = Instant::now();
        let mut warned = false;

        loop {
            let token = new_token();
            match Self::try_create(path, &token) {
                Ok(()) => {
                    if warned {
                        log::warn!(
                            "Lock acquired after {:.1}s contention: {}",
                            start.elapsed().as_secs_f64(),
                            path.display()
                        );
                    }
                    return Ok(Self {
                        path: path.to_path_buf(),
                        token,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if Self::break_if_stale(path, stale_after) {
                        continue;
                    }
                    if !warned && start.elapsed() > CONTENTION_WARN_AFTER {
                        log::warn!("Lock contention on {}, waiting...", path.display());
                        warned = true;
                    }
                }
                Err(e) => return Err(StorageError::write(path, e)),
            }

            if start.elapsed() >= timeout {
                return Err(StorageError::LockTimeout {
                    path: path.to_path_buf(),
                    timeout,
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn try_create(path: &Path, token: &str) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        if let Err(e) = file.write_all(token.as_bytes()) {
            drop(file);
            let _ = fs::remove_file(path);
            return Err(e);
        }
        Ok(())
    }

    /// Break the lock if it is older than `stale_after`.
    ///
    /// Returns true when the caller should retry right away.
    fn break_if_stale(path: &Path, stale_after: Duration) -> bool {
        let Some(holder) = Holder::read(path) else {
            return false;
        };
        let age = SystemTime::now()
            .duration_since(holder.modified)
            .unwrap_or_default();
        if age <= stale_after {
            return false;
        }

        log::warn!(
            "Breaking stale lock {} (held for {:.0}s)",
            path.display(),
            age.as_secs_f64()
        );
        Self::remove_holder(path, &holder);
        true
    }

    /// Remove the lock at `path` only if it still belongs to `expected`.
    fn remove_holder(path: &Path, expected: &Holder) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let aside = path.with_file_name(format!("{}.stale-{}", name, new_token()));

        // Fails when another waiter already moved it.
        if fs::rename(path, &aside).is_err() {
            return;
        }
        if Holder::read(&aside).as_ref() != Some(expected) {
            log::debug!("Lock {} changed hands while being broken, restoring", path.display());
            if let Err(e) = fs::hard_link(&aside, path) {
                log::warn!("Could not restore lock {}: {}", path.display(), e);
            }
        }
        let _ = fs::remove_file(&aside);
    }

    /// Lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(token) if token == self.token => {
                let _ = fs::remove_file(&self.path);
            }
            Ok(_) => log::warn!(
                "Lock {} was broken while held, leaving the new holder's lock",
                self.path.display()
            ),
            Err(_) => {}
        }
    }
}
