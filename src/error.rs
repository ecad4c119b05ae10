//! Exit codes and structured error output for the `filecache` binary.

use serde::Serialize;

use crate::cache::{BatchError, StorageError};
use crate::config::ConfigError;

/// Process exit codes.
///
/// - 0: Success
/// - 1: General error (I/O, lock timeout, bad input)
/// - 2: Miss (`get` found no usable item)
/// - 3: Partial failure (some keys of a batch failed, or GC hit errors)
/// - 78: Configuration error (`EX_CONFIG`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitCode {
    /// Completed normally.
    Success = 0,
    /// Unexpected failure.
    GeneralError = 1,
    /// The requested key was not found or is not valid.
    Miss = 2,
    /// Some, but not all, of the requested work failed.
    PartialFailure = 3,
    /// Configuration missing or invalid.
    ConfigError = 78,
}

impl ExitCode {
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Machine-readable code.
    #[must_use]
    pub fn code_prefix(self) -> &'static str {
        match self {
            Self::Success => "FC000",
            Self::GeneralError => "FC001",
            Self::Miss => "FC002",
            Self::PartialFailure => "FC003",
            Self::ConfigError => "FC078",
        }
    }

    /// Exit code for an error returned by [`crate::run_app`].
    #[must_use]
    pub fn for_error(err: &anyhow::Error) -> Self {
        if err.chain().any(|cause| cause.is::<ConfigError>()) {
            Self::ConfigError
        } else if err.chain().any(|cause| cause.is::<BatchError>()) {
            Self::PartialFailure
        } else {
            Self::GeneralError
        }
    }
}

/// Structured error information for JSON output.
#[derive(Debug, Serialize)]
pub struct StructuredError {
    /// The error code (e.g., "FC001")
    pub code: String,
    /// The exit code number
    pub exit_code: i32,
    /// Human-readable error message, including its causes
    pub message: String,
    /// File involved, when the failure was a storage error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Keys that failed in a batch operation
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_keys: Vec<String>,
}

impl StructuredError {
    #[must_use]
    pub fn new(err: &anyhow::Error, exit_code: ExitCode) -> Self {
        let path = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<StorageError>())
            .and_then(StorageError::path)
            .map(|p| p.display().to_string());
        let failed_keys = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<BatchError>())
            .map(|batch| batch.failed_keys().map(str::to_string).collect())
            .unwrap_or_default();

        Self {
            code: exit_code.code_prefix().to_string(),
            exit_code: exit_code.as_i32(),
            message: format!("{err:#}"),
            path,
            failed_keys,
        }
    }
}
