//! Plugin-level configuration for the task driver.
//!
//! This module defines process-wide configuration:
//! - [`PluginConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Engine backend selection and compilation settings
//! - [`CacheConfig`]: Module cache sizing, eviction, expiration and pre-caching
//!
//! Decoding is done with serde; [`PluginConfig::validate`] enforces the
//! constraints that serde defaults cannot express.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::DriverError;

/// Top-level plugin configuration.
///
/// # Example
///
/// ```toml
/// [engine]
/// backend = "wasmtime"
///
/// [cache]
/// enabled = true
/// type = "lfu"
/// size = 5
///
/// [cache.expiration]
/// enabled = true
/// entryTTL = 600
///
/// [cache.preCache]
/// enabled = true
/// modulesDir = "/opt/wasm/modules"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PluginConfig {
    /// Engine backend configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Module cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl PluginConfig {
    /// Load configuration from a TOML file.
    ///
    /// The loaded configuration is validated before it is returned.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DriverError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DriverError::configuration(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;

        debug!(path = %path.display(), "Plugin configuration file read");
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, DriverError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| DriverError::configuration(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the constraints between configuration values.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if:
    /// - The cache size is zero
    /// - Expiration is enabled with a zero TTL
    /// - Pre-caching is enabled without a modules directory
    pub fn validate(&self) -> Result<(), DriverError> {
        let cache = &self.cache;

        if cache.size == 0 {
            return Err(DriverError::configuration(format!(
                "cache size must be > 0, but specified {}",
                cache.size
            )));
        }

        if cache.expiration.enabled && cache.expiration.entry_ttl == 0 {
            return Err(DriverError::configuration(format!(
                "cache entry time-to-live must be > 0, but specified {}",
                cache.expiration.entry_ttl
            )));
        }

        if cache.pre_cache.enabled && cache.pre_cache.modules_dir.is_none() {
            return Err(DriverError::configuration(
                "cache pre-cache is enabled but modulesDir is not specified",
            ));
        }

        Ok(())
    }
}

/// Engine backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// WebAssembly runtime used to compile and run modules.
    #[serde(default)]
    pub backend: BackendKind,

    /// Enable optimizing compilation.
    ///
    /// Disabling this trades execution speed for faster compilation.
    #[serde(default = "defaults::optimize")]
    pub optimize: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            optimize: defaults::optimize(),
        }
    }
}

/// Supported engine backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Wasmtime with Cranelift and epoch interruption.
    #[default]
    Wasmtime,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Wasmtime => write!(f, "wasmtime"),
        }
    }
}

/// Module cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Enable the module cache.
    ///
    /// When disabled every task start reads and compiles its module from disk.
    #[serde(default = "defaults::cache_enabled")]
    pub enabled: bool,

    /// Eviction policy used when the cache is full.
    #[serde(rename = "type", default)]
    pub kind: EvictionKind,

    /// Maximum number of cached modules.
    #[serde(default = "defaults::cache_size")]
    pub size: usize,

    /// Time-based expiration of cache entries.
    #[serde(default)]
    pub expiration: ExpirationConfig,

    /// Warm-up of the cache from a directory at startup.
    #[serde(default)]
    pub pre_cache: PreCacheConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::cache_enabled(),
            kind: EvictionKind::default(),
            size: defaults::cache_size(),
            expiration: ExpirationConfig::default(),
            pre_cache: PreCacheConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Get the entry TTL if expiration is enabled.
    pub fn ttl(&self) -> Option<Duration> {
        self.expiration
            .enabled
            .then(|| Duration::from_secs(self.expiration.entry_ttl))
    }
}

/// Cache entry expiration configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExpirationConfig {
    /// Enable expiration.
    #[serde(default = "defaults::expiration_enabled")]
    pub enabled: bool,

    /// Entry time-to-live in seconds.
    #[serde(
        rename = "entryTTL",
        alias = "entry_ttl",
        default = "defaults::entry_ttl"
    )]
    pub entry_ttl: u64,
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::expiration_enabled(),
            entry_ttl: defaults::entry_ttl(),
        }
    }
}

/// Cache warm-up configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreCacheConfig {
    /// Enable warm-up at startup.
    #[serde(default)]
    pub enabled: bool,

    /// Directory scanned recursively for `.wasm` modules.
    #[serde(default)]
    pub modules_dir: Option<PathBuf>,
}

/// Cache replacement strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum EvictionKind {
    /// Least frequently used; ties go to the oldest insertion.
    #[default]
    Lfu,
    /// Least recently used.
    Lru,
    /// Adaptive replacement between recency and frequency.
    Arc,
    /// No ordering guarantee.
    Simple,
}

impl EvictionKind {
    /// All accepted configuration values.
    pub const VALUES: [&'static str; 4] = ["lfu", "lru", "arc", "simple"];

    /// Get the configuration name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            EvictionKind::Lfu => "lfu",
            EvictionKind::Lru => "lru",
            EvictionKind::Arc => "arc",
            EvictionKind::Simple => "simple",
        }
    }
}

impl fmt::Display for EvictionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvictionKind {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lfu" => Ok(EvictionKind::Lfu),
            "lru" => Ok(EvictionKind::Lru),
            "arc" => Ok(EvictionKind::Arc),
            "simple" => Ok(EvictionKind::Simple),
            other => Err(DriverError::configuration(format!(
                "unexpected cache type specified, expected types: [{}], but specified {other}",
                Self::VALUES.join(", ")
            ))),
        }
    }
}

impl TryFrom<String> for EvictionKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse().map_err(|e: DriverError| e.to_string())
    }
}

impl From<EvictionKind> for String {
    fn from(kind: EvictionKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn optimize() -> bool {
        true
    }

    pub const fn cache_enabled() -> bool {
        true
    }

    pub const fn cache_size() -> usize {
        5
    }

    pub const fn expiration_enabled() -> bool {
        true
    }

    pub const fn entry_ttl() -> u64 {
        600
    }
}
