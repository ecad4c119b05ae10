//! Error types for cache store operations.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Result type for store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failures of the underlying storage. Always surfaced to the caller.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The bin directory could not be created.
    #[error("could not create cache directory {path}: {source}")]
    CreateDir {
        /// Directory that was being created
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The bin directory exists but cannot be written to.
    #[error("cache directory {0} is not writable")]
    NotWritable(PathBuf),

    /// Writing or renaming a file failed.
    #[error("could not write cache file {path}: {source}")]
    Write {
        /// File that was being written
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Reading a file failed for a reason other than it being absent.
    #[error("could not read {path}: {source}")]
    Read {
        /// File that was being read
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Removing a file or directory failed.
    #[error("could not remove {path}: {source}")]
    Remove {
        /// Path that was being removed
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The checksum registry lock could not be taken in time.
    #[error("timed out after {timeout:?} waiting for lock {path}")]
    LockTimeout {
        /// Lock file path
        path: PathBuf,
        /// How long we waited
        timeout: Duration,
    },

    /// A persisted checksum counter could not be decoded.
    #[error("corrupt checksum file {0}")]
    CorruptChecksum(PathBuf),

    /// An item or counter could not be serialized.
    #[error("could not encode cache data: {0}")]
    Encode(#[from] serde_json::Error),

    /// A bin-wide operation left some files behind.
    #[error("bin operation incomplete")]
    Incomplete(#[from] BatchError),
}

impl StorageError {
    /// Classify a failed write, reporting permission problems on the
    /// directory rather than the file.
    pub(crate) fn write(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            let dir = path.parent().unwrap_or(path);
            return Self::NotWritable(dir.to_path_buf());
        }
        Self::Write {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Path associated with this error, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::CreateDir { path, .. }
            | Self::Write { path, .. }
            | Self::Read { path, .. }
            | Self::Remove { path, .. }
            | Self::LockTimeout { path, .. } => Some(path),
            Self::NotWritable(path) | Self::CorruptChecksum(path) => Some(path),
            Self::Encode(_) | Self::Incomplete(_) => None,
        }
    }
}

/// Per-key failures of a batch operation. Keys not listed succeeded.
#[derive(Debug, Error)]
#[error("{} of {attempted} cache operations failed", failures.len())]
pub struct BatchError {
    /// Number of keys the batch touched.
    pub attempted: usize,
    /// Failed keys with their errors, in input order.
    pub failures: Vec<(String, StorageError)>,
}

impl BatchError {
    /// Turn collected failures into a result.
    pub(crate) fn check(
        attempted: usize,
        failures: Vec<(String, StorageError)>,
    ) -> Result<(), Self> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Self {
                attempted,
                failures,
            })
        }
    }

    /// Keys that failed.
    pub fn failed_keys(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|(key, _)| key.as_str())
    }
}
