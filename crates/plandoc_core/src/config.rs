//! Configuration types for a plandoc store.

use crate::error::{Result, StoreError};
use crate::types::{HistoryPolicy, MAX_HISTORY_DEPTH};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// File name of the configuration inside the store root.
pub const CONFIG_FILE: &str = "config.toml";

/// Comprehensive configuration for a plandoc store.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// In-process resource lock settings.
    #[serde(default)]
    pub locks: LockConfig,

    /// Cross-process advisory lock settings.
    #[serde(default)]
    pub file_locks: FileLockConfig,

    /// Entity and index cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// History policy applied to newly created plans.
    #[serde(default)]
    pub history: HistoryDefaults,
}

impl Config {
    /// Load configuration from `<root>/config.toml`, falling back to defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| StoreError::ConfigError(format!("failed to read config: {}", e)))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| StoreError::ConfigError(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `<root>/config.toml`.
    pub fn save(&self, root: &Path) -> Result<()> {
        let path = root.join(CONFIG_FILE);
        let content = toml::to_string_pretty(self)
            .map_err(|e| StoreError::ConfigError(format!("failed to serialize config: {}", e)))?;
        fs::write(&path, content)
            .map_err(|e| StoreError::ConfigError(format!("failed to write config: {}", e)))?;
        Ok(())
    }

    /// Rejects values the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.history.max_history_depth > MAX_HISTORY_DEPTH {
            return Err(StoreError::ConfigError(format!(
                "history.max_history_depth must be between 0 and {}, got {}",
                MAX_HISTORY_DEPTH, self.history.max_history_depth
            )));
        }
        if self.file_locks.retry_interval_ms == 0 {
            return Err(StoreError::ConfigError(
                "file_locks.retry_interval_ms must be positive".to_string(),
            ));
        }
        if self.cache.index_mode == CacheMode::Ttl && self.cache.index_ttl_secs == 0 {
            return Err(StoreError::ConfigError(
                "cache.index_ttl_secs must be positive when index_mode = \"ttl\"".to_string(),
            ));
        }
        Ok(())
    }
}

/// In-process lock manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockConfig {
    /// How long repository operations wait for a contended lock (default: 5000).
    pub acquire_timeout_ms: u64,

    /// TTL applied to repository locks; 0 means never expire (default: 0).
    pub default_ttl_ms: u64,

    /// How long `dispose()` waits for in-flight acquires to unwind (default: 100).
    pub dispose_grace_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 5_000,
            default_ttl_ms: 0,
            dispose_grace_ms: 100,
        }
    }
}

impl LockConfig {
    /// Acquire timeout as a Duration.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Default TTL, `None` when locks never expire.
    pub fn default_ttl(&self) -> Option<Duration> {
        (self.default_ttl_ms > 0).then(|| Duration::from_millis(self.default_ttl_ms))
    }

    /// Dispose grace period as a Duration.
    pub fn dispose_grace(&self) -> Duration {
        Duration::from_millis(self.dispose_grace_ms)
    }
}

/// Cross-process lock manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileLockConfig {
    /// Unheld lock files older than this are removed at startup (default: 300).
    pub stale_threshold_secs: u64,

    /// How long to keep retrying a contended lock file (default: 5000).
    pub acquire_timeout_ms: u64,

    /// Sleep between retries of a contended lock file (default: 10).
    pub retry_interval_ms: u64,
}

impl Default for FileLockConfig {
    fn default() -> Self {
        Self {
            stale_threshold_secs: 300,
            acquire_timeout_ms: 5_000,
            retry_interval_ms: 10,
        }
    }
}

impl FileLockConfig {
    /// Stale threshold as a Duration.
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    /// Acquire timeout as a Duration.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Retry interval as a Duration.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// How cached index entries are invalidated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Entries are replaced or dropped when the index is mutated.
    #[default]
    Version,
    /// Entries additionally expire after a fixed time.
    Ttl,
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Entities kept in each repository's LRU cache; 0 disables it (default: 256).
    pub entity_capacity: usize,

    /// Index entries kept in each index's LRU cache; 0 disables it (default: 1024).
    pub index_capacity: usize,

    /// Index cache invalidation mode (default: version).
    pub index_mode: CacheMode,

    /// Lifetime of index cache entries in `ttl` mode (default: 60).
    pub index_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entity_capacity: 256,
            index_capacity: 1024,
            index_mode: CacheMode::Version,
            index_ttl_secs: 60,
        }
    }
}

impl CacheConfig {
    /// Index cache lifetime as a Duration.
    pub fn index_ttl(&self) -> Duration {
        Duration::from_secs(self.index_ttl_secs)
    }
}

/// History policy given to plans created without an explicit one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryDefaults {
    /// Keep snapshots for new plans (default: true).
    pub enable_history: bool,

    /// Snapshots retained per entity, 0..=10 (default: 5).
    pub max_history_depth: u32,
}

impl Default for HistoryDefaults {
    fn default() -> Self {
        Self {
            enable_history: true,
            max_history_depth: 5,
        }
    }
}

impl From<&HistoryDefaults> for HistoryPolicy {
    fn from(defaults: &HistoryDefaults) -> Self {
        HistoryPolicy {
            enable_history: defaults.enable_history,
            max_history_depth: defaults.max_history_depth,
        }
    }
}
