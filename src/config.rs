/// Worker configuration consumed by the import cache, loaded from config.json
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{CacheError, Result};

/// Default location of the package size table, relative to the worker
/// installation root.
pub const DEFAULT_PKG_SIZES_FILE: &str = "cache-manager/package_sizes.txt";

/// Configuration surface of the import cache.
///
/// Mirrors the cache-relevant subset of the worker's config.json. Path fields
/// may be relative only when the config was loaded from a file; they are then
/// resolved against the config file's directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Base directory for relative path fields; set when loaded from a file.
    #[serde(skip)]
    base: Option<PathBuf>,

    /// Name of the cluster, used to tag cache sandboxes.
    #[serde(default)]
    pub cluster_name: String,

    /// Eviction budget in kilobytes. Zero disables the import cache.
    #[serde(default)]
    pub import_cache_size: u64,

    /// Host directory holding cache-sandbox working dirs.
    #[serde(default)]
    pub import_cache_dir: String,

    /// Root filesystem template for cache sandboxes.
    #[serde(default)]
    pub olcontainer_cache_base: String,

    /// Package size table; falls back to an installation-relative default.
    #[serde(default)]
    pub pkg_sizes_file: Option<String>,

    /// Emit elapsed-time logs for provisioning phases.
    #[serde(default)]
    pub timing: bool,
}

impl Config {
    /// Read and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CacheError::Config(format!("could not open config {:?}: {}", path, e)))?;

        let mut config: Config = serde_json::from_str(&raw)
            .map_err(|e| CacheError::Config(format!("could not parse config {:?}: {}", path, e)))?;

        config.base = path.parent().map(Path::to_path_buf);
        config.validate()?;

        Ok(config)
    }

    /// Verify required fields and resolve relative paths.
    ///
    /// Hand-built configs (no backing file) must use absolute paths.
    pub fn validate(&mut self) -> Result<()> {
        if self.cluster_name.is_empty() {
            self.cluster_name = "default".to_string();
        }

        if self.import_cache_size == 0 {
            return Ok(());
        }

        if self.import_cache_dir.is_empty() {
            return Err(CacheError::Config(
                "must specify import_cache_dir if using import cache".to_string(),
            ));
        }
        self.import_cache_dir = self.resolve("import_cache_dir", &self.import_cache_dir.clone())?;

        if self.olcontainer_cache_base.is_empty() {
            return Err(CacheError::Config(
                "must specify olcontainer_cache_base if using import cache".to_string(),
            ));
        }
        self.olcontainer_cache_base =
            self.resolve("olcontainer_cache_base", &self.olcontainer_cache_base.clone())?;

        if let Some(sizes) = self.pkg_sizes_file.clone() {
            self.pkg_sizes_file = Some(self.resolve("pkg_sizes_file", &sizes)?);
        }

        Ok(())
    }

    /// Path of the package size table, resolved against the config base when
    /// no explicit path was given.
    pub fn pkg_sizes_path(&self) -> PathBuf {
        match &self.pkg_sizes_file {
            Some(path) => PathBuf::from(path),
            None => match &self.base {
                Some(base) => base.join(DEFAULT_PKG_SIZES_FILE),
                None => PathBuf::from(DEFAULT_PKG_SIZES_FILE),
            },
        }
    }

    fn resolve(&self, field: &str, value: &str) -> Result<String> {
        let path = Path::new(value);
        if path.is_absolute() {
            return Ok(value.to_string());
        }

        match &self.base {
            Some(base) => Ok(base.join(path).to_string_lossy().into_owned()),
            None => Err(CacheError::Config(format!(
                "{} cannot be relative, unless config is loaded from file",
                field
            ))),
        }
    }
}

/// Operational bounds for provisioning.
///
/// Defaults match production behavior; tests shorten them to exercise the
/// timeout paths without multi-second waits.
#[derive(Debug, Clone)]
pub struct CacheLimits {
    /// How long to wait for a new fork server's ready handshake.
    pub ready_timeout: Duration,
    /// Bound on a single fork-request socket round-trip.
    pub fork_timeout: Duration,
    /// How long to wait for the root fork server's socket to appear.
    pub root_sock_timeout: Duration,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(20),
            fork_timeout: Duration::from_secs(60),
            root_sock_timeout: Duration::from_secs(5),
        }
    }
}
