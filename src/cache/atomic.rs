//! Atomic file replacement.
//!
//! Data is written to a hidden temp file in the destination directory and
//! renamed over the target, so readers see either the old or the new
//! contents in full. Temp files share the [`TEMP_PREFIX`] prefix, which
//! garbage collection uses to find leftovers of interrupted writers.
//!
//! On unix, files are created with mode `0666` minus the process umask, the
//! same as a plain `fs::write`, so a bin can be shared by users of one group.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::SystemTime;

use super::error::StorageError;

/// Prefix of in-flight temp files.
pub const TEMP_PREFIX: &str = ".tmp-";

/// Requested mode of new files, before the umask applies.
#[cfg(unix)]
const FILE_MODE: u32 = 0o666;

/// Write `bytes` to `target` atomically.
///
/// `target`'s parent directory must already exist.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    write_atomic_if(target, bytes, || true).map(|_| ())
}

/// Like [`write_atomic`], but `precondition` is checked once the new
/// contents are staged, right before the rename. If it returns false the
/// target is left alone and `Ok(false)` is returned.
pub fn write_atomic_if<F>(
    target: &Path,
    bytes: &[u8],
    precondition: F,
) -> Result<bool, StorageError>
where
    F: FnOnce() -> bool,
{
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let write_err = |source: io::Error| StorageError::write(target, source);

    let mut builder = tempfile::Builder::new();
    builder.prefix(TEMP_PREFIX);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(fs::Permissions::from_mode(FILE_MODE));
    }

    let mut tmp = builder.tempfile_in(dir).map_err(write_err)?;
    tmp.write_all(bytes).map_err(write_err)?;
    tmp.as_file().sync_data().map_err(write_err)?;

    if !precondition() {
        return Ok(false);
    }
    // A failed persist drops the temp file, which removes it.
    tmp.persist(target).map_err(|e| write_err(e.error))?;
    Ok(true)
}

/// Identity of one version of a file.
///
/// Every atomic write creates a new inode, so on unix a replaced file is
/// detected even when size and mtime happen to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
    #[cfg(unix)]
    inode: u64,
}

impl Fingerprint {
    fn of(meta: &fs::Metadata) -> Self {
        #[cfg(unix)]
        use std::os::unix::fs::MetadataExt;

        Self {
            len: meta.len(),
            modified: meta.modified().ok(),
            #[cfg(unix)]
            inode: meta.ino(),
        }
    }
}

/// Fingerprint of the file at `path`, `None` if it does not exist.
pub fn fingerprint(path: &Path) -> io::Result<Option<Fingerprint>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(Fingerprint::of(&meta))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Remove a file, treating "already gone" as success.
///
/// Returns whether a file was actually removed.
pub fn remove_if_exists(path: &Path) -> Result<bool, StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::Remove {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Read a file, mapping "not found" to `None`.
pub fn read_if_exists(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
