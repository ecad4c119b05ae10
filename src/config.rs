//! Configuration management.
//!
//! Settings are layered with figment, lowest priority first:
//!
//! 1. Built-in defaults (serde defaults of [`Settings`])
//! 2. TOML config file
//! 3. Environment variables prefixed with `FILECACHE_`, using `__` as the
//!    nesting separator
//!
//! ```toml
//! [directory]
//! default = "/var/cache/filecache"
//!
//! [directory.bins]
//! render = "/mnt/fast/render"
//!
//! [store]
//! lock_timeout_ms = 5000
//! gc_max_items = 10000
//! ```
//!
//! The same values from the environment:
//!
//! ```bash
//! FILECACHE_DIRECTORY__DEFAULT=/var/cache/filecache
//! FILECACHE_DIRECTORY__BINS__render=/mnt/fast/render
//! FILECACHE_STORE__LOCK_TIMEOUT_MS=5000
//! ```
//!
//! A configuration without any directory is rejected at load time with
//! [`ConfigError::Unconfigured`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{GcBudget, StoreOptions};
use crate::key::is_valid_name;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "FILECACHE_";

/// Configuration problems. Fatal where they occur.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Neither a default directory nor any bin directory is configured.
    #[error("no cache directory configured: set directory.default or a directory.bins entry")]
    Unconfigured,

    /// The bin has no override and there is no default directory.
    #[error("no directory configured for cache bin '{0}'")]
    NoDirectory(String),

    /// The bin name cannot be used as a directory name.
    #[error("invalid cache bin name '{0}': use letters, digits, '-' and '_' only")]
    InvalidBin(String),

    /// An explicitly requested config file does not exist.
    #[error("config file not found: {}", .0.display())]
    MissingFile(PathBuf),

    /// The configuration sources could not be read or parsed.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// Where bins live on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySettings {
    /// Parent directory; bin `x` lives in `<default>/x`.
    pub default: Option<PathBuf>,
    /// Per-bin directory overrides.
    pub bins: BTreeMap<String, PathBuf>,
}

impl DirectorySettings {
    /// True if no directory at all is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.default.is_none() && self.bins.is_empty()
    }
}

/// Store tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Checksum registry lock wait, in milliseconds.
    pub lock_timeout_ms: u64,
    /// Age in seconds after which a registry lock is broken.
    pub stale_lock_secs: u64,
    /// Age in seconds after which GC removes leftover temp files.
    pub stale_temp_secs: u64,
    /// Files examined per GC call (unset = unlimited).
    pub gc_max_items: Option<usize>,
    /// Milliseconds spent per GC call (unset = unlimited).
    pub gc_max_millis: Option<u64>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5000,
            stale_lock_secs: 30,
            stale_temp_secs: 3600,
            gc_max_items: Some(10_000),
            gc_max_millis: Some(2000),
        }
    }
}

impl StoreSettings {
    /// Convert to runtime store options.
    #[must_use]
    pub fn to_options(&self) -> StoreOptions {
        StoreOptions {
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            stale_lock_after: Duration::from_secs(self.stale_lock_secs),
            stale_temp_after: Duration::from_secs(self.stale_temp_secs),
            gc_budget: GcBudget {
                max_items: self.gc_max_items,
                max_duration: self.gc_max_millis.map(Duration::from_millis),
            },
        }
    }
}

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Bin directories.
    pub directory: DirectorySettings,
    /// Store tunables.
    pub store: StoreSettings,
}

impl Settings {
    /// The layered figment: optional TOML file, then environment.
    #[must_use]
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Extract and validate settings from `figment`.
    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        let settings: Self = figment.extract().map_err(Box::new)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from an optional TOML file plus the environment.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingFile`] if `path` does not exist,
    /// [`ConfigError::Load`] for unreadable or malformed sources,
    /// [`ConfigError::Unconfigured`] when no directory is configured and
    /// [`ConfigError::InvalidBin`] for unusable bin override names.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path.filter(|p| !p.is_file()) {
            return Err(ConfigError::MissingFile(path.to_path_buf()));
        }
        let settings = Self::from_figment(&Self::figment(path))?;
        log::debug!(
            "Loaded configuration (default dir: {:?}, {} bin overrides)",
            settings.directory.default,
            settings.directory.bins.len()
        );
        Ok(settings)
    }

    /// Load from the platform config file, if present, plus the
    /// environment.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_config_path().filter(|p| p.is_file());
        Self::load(path.as_deref())
    }

    /// Platform-specific config file location.
    #[must_use]
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("io", "filecache", "filecache")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Check that the settings can serve at least one bin.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.directory.is_empty() {
            return Err(ConfigError::Unconfigured);
        }
        if let Some(bad) = self.directory.bins.keys().find(|bin| !is_valid_name(bin)) {
            return Err(ConfigError::InvalidBin(bad.clone()));
        }
        Ok(())
    }
}
