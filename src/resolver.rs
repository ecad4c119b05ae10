//! Bin name to directory resolution and store construction.

use std::path::PathBuf;

use crate::cache::{FileCacheStore, StoreOptions};
use crate::config::{ConfigError, DirectorySettings, Settings};
use crate::key::is_valid_name;

/// Maps bin names to directories.
///
/// A bin-specific override wins over `<default>/<bin>`. Resolution never
/// touches the filesystem; directories are created by the store on first
/// write.
#[derive(Debug, Clone)]
pub struct BinDirectoryResolver {
    directories: DirectorySettings,
}

impl BinDirectoryResolver {
    /// Create a resolver.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Unconfigured`] if neither a default directory
    /// nor any override is configured.
    pub fn new(directories: DirectorySettings) -> Result<Self, ConfigError> {
        if directories.is_empty() {
            return Err(ConfigError::Unconfigured);
        }
        Ok(Self { directories })
    }

    /// Directory for `bin`.
    pub fn resolve(&self, bin: &str) -> Result<PathBuf, ConfigError> {
        if !is_valid_name(bin) {
            return Err(ConfigError::InvalidBin(bin.to_string()));
        }
        if let Some(dir) = self.directories.bins.get(bin) {
            return Ok(dir.clone());
        }
        self.directories
            .default
            .as_ref()
            .map(|default| default.join(bin))
            .ok_or_else(|| ConfigError::NoDirectory(bin.to_string()))
    }
}

/// Hands out a [`FileCacheStore`] per bin.
#[derive(Debug, Clone)]
pub struct FileCacheFactory {
    resolver: BinDirectoryResolver,
    options: StoreOptions,
}

impl FileCacheFactory {
    pub fn new(resolver: BinDirectoryResolver, options: StoreOptions) -> Self {
        Self { resolver, options }
    }

    /// Factory from loaded settings.
    pub fn from_settings(settings: Settings) -> Result<Self, ConfigError> {
        let options = settings.store.to_options();
        let resolver = BinDirectoryResolver::new(settings.directory)?;
        Ok(Self::new(resolver, options))
    }

    #[must_use]
    pub fn resolver(&self) -> &BinDirectoryResolver {
        &self.resolver
    }

    /// Store for `bin`.
    pub fn get(&self, bin: &str) -> Result<FileCacheStore, ConfigError> {
        let dir = self.resolver.resolve(bin)?;
        log::debug!("Cache bin '{}' -> {}", bin, dir.display());
        Ok(FileCacheStore::new(bin, dir, self.options.clone()))
    }
}
