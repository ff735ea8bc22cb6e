//! Store configuration.
//!
//! [`StoreConfig`] groups the settings for every storage component. It is
//! usually loaded from a TOML file; any section or field left out falls
//! back to its [`Default`]. A handful of environment variables override
//! the file so deployments can relocate data without editing it.
//!
//! ```toml
//! [file]
//! path = "data/coffer.json"
//! repair_corrupt = true
//!
//! [cache]
//! max_age_ms = 300000
//! remote_timeout_ms = 5000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Overrides [`FileStoreConfig::path`].
pub const ENV_DATA_FILE: &str = "COFFER_DATA_FILE";
/// Overrides [`SqliteConfig::path`].
pub const ENV_DB_PATH: &str = "COFFER_DB_PATH";
/// Overrides [`CacheConfig::max_age_ms`].
pub const ENV_CACHE_MAX_AGE: &str = "COFFER_CACHE_MAX_AGE_MS";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub file: FileStoreConfig,
    pub cache: CacheConfig,
    pub sqlite: SqliteConfig,
    pub events: EventsConfig,
}

impl StoreConfig {
    /// Read and parse a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env_overrides()?;
        debug!(path = %path.display(), "store config loaded");
        Ok(config)
    }

    /// Parse TOML without consulting the environment.
    pub fn from_toml_str(text: &str) -> StoreResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `COFFER_*` environment variables on top of the current values.
    pub fn apply_env_overrides(&mut self) -> StoreResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> StoreResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_DATA_FILE) {
            self.file.path = PathBuf::from(path);
        }
        if let Some(path) = lookup(ENV_DB_PATH) {
            self.sqlite.path = PathBuf::from(path);
        }
        if let Some(raw) = lookup(ENV_CACHE_MAX_AGE) {
            self.cache.max_age_ms = raw.trim().parse().map_err(|_| {
                StoreError::Config(format!("{ENV_CACHE_MAX_AGE} must be an integer, got {raw:?}"))
            })?;
        }
        Ok(())
    }
}

/// Flat-file store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStoreConfig {
    /// Location of the JSON document.
    pub path: PathBuf,
    /// Move a corrupt file aside and start empty instead of failing.
    pub repair_corrupt: bool,
    /// Pretty-print the persisted JSON.
    pub pretty: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/coffer.json"),
            repair_corrupt: true,
            pretty: false,
        }
    }
}

impl FileStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_repair_corrupt(mut self, repair: bool) -> Self {
        self.repair_corrupt = repair;
        self
    }

    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }
}

/// Cache manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Age in milliseconds after which a cached document is re-fetched on
    /// next read.
    pub max_age_ms: u64,
    /// Deadline for any single remote call.
    pub remote_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 300_000,
            remote_timeout_ms: 5_000,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}

/// SQLite document database settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub path: PathBuf,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/coffer.db"),
        }
    }
}

/// Event bus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events buffered per subscriber before it starts lagging.
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}
