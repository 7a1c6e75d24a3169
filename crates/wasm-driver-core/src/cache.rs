//! Module cache.
//!
//! [`ModuleCache`] keeps serialized compiled modules keyed by module path so
//! repeated runs of the same module skip both the disk read and compilation.
//!
//! # Behavior
//!
//! - **Capacity**: never more than `capacity` entries after an operation completes
//! - **Expiration**: passive; an expired entry is dropped on `get` and never returned
//! - **Eviction**: expired entries are reclaimed first, then the [`EvictionPolicy`] picks a victim
//! - **Warm-up**: [`ModuleCache::warm`] pre-compiles every `.wasm` file under a directory

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use wasm_driver_common::{BackendKind, CacheConfig, DriverError, EvictionKind};

use crate::backend::EngineBackend;
use crate::eviction::{EvictionPolicy, ModuleKey, new_policy};

/// File extension of module files picked up by warm-up.
const MODULE_EXTENSION: &str = "wasm";

/// A serialized compiled module.
///
/// Immutable once created. Cloning shares the artifact bytes, so concurrent
/// instantiations of one module never copy it.
#[derive(Clone)]
pub struct CachedModule {
    key: ModuleKey,
    backend: BackendKind,
    artifact: Bytes,
    content_hash: String,
    created_at: Instant,
}

impl CachedModule {
    /// Create a cached module produced by `backend` for the module at `key`.
    pub fn new(key: PathBuf, backend: BackendKind, artifact: Bytes, content_hash: String) -> Self {
        Self {
            key,
            backend,
            artifact,
            content_hash,
            created_at: Instant::now(),
        }
    }

    /// Path of the module this artifact was compiled from.
    pub fn key(&self) -> &Path {
        &self.key
    }

    /// Backend that produced the artifact.
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Serialized module bytes.
    pub fn artifact(&self) -> &Bytes {
        &self.artifact
    }

    /// Hash of the original module bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// When the artifact was produced.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

impl std::fmt::Debug for CachedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedModule")
            .field("key", &self.key)
            .field("backend", &self.backend)
            .field("artifact_len", &self.artifact.len())
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Eviction policy in use.
    pub kind: EvictionKind,
    /// Maximum number of entries.
    pub capacity: usize,
    /// Current number of entries.
    pub entries: usize,
    /// Lookups that returned a module.
    pub hits: u64,
    /// Lookups that found nothing or an expired entry.
    pub misses: u64,
    /// Live entries removed to make room.
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed.
    pub expirations: u64,
}

struct CacheEntry {
    module: CachedModule,
    inserted_at: Instant,
}

struct CacheInner {
    entries: HashMap<ModuleKey, CacheEntry>,
    policy: Box<dyn EvictionPolicy>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl CacheInner {
    fn is_expired(entry: &CacheEntry, ttl: Option<Duration>, now: Instant) -> bool {
        ttl.is_some_and(|ttl| now.duration_since(entry.inserted_at) >= ttl)
    }

    fn purge_expired(&mut self, ttl: Option<Duration>, now: Instant) {
        let expired: Vec<ModuleKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| Self::is_expired(entry, ttl, now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            self.entries.remove(&key);
            self.policy.remove(&key);
            self.expirations += 1;
            debug!(module = %key.display(), "Cache entry expired");
        }
    }
}

/// Keyed store of serialized modules with a pluggable eviction policy.
///
/// All bookkeeping happens under one lock, held only for the single lookup
/// or admission being performed.
pub struct ModuleCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    ttl: Option<Duration>,
    kind: EvictionKind,
}

impl ModuleCache {
    /// Create a cache holding at most `capacity` modules.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `capacity` is zero or `ttl` is zero.
    pub fn new(
        capacity: usize,
        kind: EvictionKind,
        ttl: Option<Duration>,
    ) -> Result<Self, DriverError> {
        if capacity == 0 {
            return Err(DriverError::configuration(
                "cache size must be > 0, but specified 0",
            ));
        }
        if ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(DriverError::configuration(
                "cache entry time-to-live must be > 0 when expiration is enabled",
            ));
        }

        Ok(Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::with_capacity(capacity),
                policy: new_policy(kind, capacity),
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            }),
            capacity,
            ttl,
            kind,
        })
    }

    /// Create a cache from the plugin's cache configuration.
    ///
    /// Returns `None` if the cache is disabled.
    pub fn from_config(config: &CacheConfig) -> Result<Option<Self>, DriverError> {
        if !config.enabled {
            return Ok(None);
        }
        Self::new(config.size, config.kind, config.ttl()).map(Some)
    }

    /// Get the module cached for `key`.
    ///
    /// An expired entry is removed and reported as absent.
    pub fn get(&self, key: &Path) -> Option<CachedModule> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let expired = match inner.entries.get(key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => CacheInner::is_expired(entry, self.ttl, now),
        };

        if expired {
            inner.entries.remove(key);
            inner.policy.remove(&key.to_path_buf());
            inner.expirations += 1;
            inner.misses += 1;
            debug!(module = %key.display(), "Cache entry expired");
            return None;
        }

        inner.hits += 1;
        inner.policy.touch(&key.to_path_buf());
        inner.entries.get(key).map(|entry| entry.module.clone())
    }

    /// Insert or replace the module under its key.
    ///
    /// When the cache is full, expired entries are reclaimed first and the
    /// eviction policy chooses a victim only if that was not enough.
    pub fn put(&self, module: CachedModule) {
        let key = module.key().to_path_buf();
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.module = module;
            entry.inserted_at = now;
            inner.policy.touch(&key);
            return;
        }

        if inner.entries.len() >= self.capacity {
            inner.purge_expired(self.ttl, now);
        }

        while inner.entries.len() >= self.capacity {
            let Some(victim) = inner.policy.evict() else {
                break;
            };
            if inner.entries.remove(&victim).is_some() {
                inner.evictions += 1;
                debug!(module = %victim.display(), policy = %self.kind, "Cache entry evicted");
            }
        }

        inner.policy.admit(&key);
        inner.entries.insert(
            key,
            CacheEntry {
                module,
                inserted_at: now,
            },
        );
    }

    /// Remove the entry for `key`, returning it if present.
    pub fn remove(&self, key: &Path) -> Option<CachedModule> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.remove(key)?;
        inner.policy.remove(&key.to_path_buf());
        Some(entry.module)
    }

    /// Returns `true` if an unexpired entry exists for `key`.
    ///
    /// Does not count as a hit or miss.
    pub fn contains(&self, key: &Path) -> bool {
        let inner = self.inner.lock();
        inner
            .entries
            .get(key)
            .is_some_and(|entry| !CacheInner::is_expired(entry, self.ttl, Instant::now()))
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns `true` if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let keys: Vec<ModuleKey> = inner.entries.keys().cloned().collect();
        for key in keys {
            inner.policy.remove(&key);
        }
        inner.entries.clear();
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entry time-to-live, if expiration is enabled.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Eviction policy in use.
    pub fn kind(&self) -> EvictionKind {
        self.kind
    }

    /// Snapshot the cache counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            kind: self.kind,
            capacity: self.capacity,
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
        }
    }

    /// Pre-compile every `.wasm` module found under `dir`.
    ///
    /// Modules are discovered recursively and loaded in path order. Nothing
    /// is compiled if more modules are found than the cache can hold, and the
    /// first module that fails to load aborts the warm-up.
    ///
    /// Returns the number of modules cached.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the directory cannot be scanned or
    /// holds too many modules, or the load error of the failing module.
    #[instrument(skip(self, backend), fields(dir = %dir.display(), capacity = self.capacity))]
    pub fn warm(&self, dir: &Path, backend: &dyn EngineBackend) -> Result<usize, DriverError> {
        let modules = discover_modules(dir)?;

        if modules.len() > self.capacity {
            return Err(DriverError::configuration(format!(
                "cache size ({}) must not be less than number of pre-cached modules ({})",
                self.capacity,
                modules.len()
            )));
        }

        if let Some(ttl) = self.ttl {
            warn!(
                ttl_secs = ttl.as_secs(),
                "Cache expiration is enabled; pre-cached modules will expire after the time-to-live"
            );
        }

        for path in &modules {
            // Compile outside the lock; only the admission below takes it.
            let module = backend.load_module(path)?;
            self.put(module);
            debug!(module = %path.display(), "Module pre-cached");
        }

        info!(modules = modules.len(), "Module cache warmed");

        Ok(modules.len())
    }
}

impl std::fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCache")
            .field("kind", &self.kind)
            .field("capacity", &self.capacity)
            .field("ttl", &self.ttl)
            .field("entries", &self.len())
            .finish()
    }
}

/// Find module files under `dir`, sorted by path.
fn discover_modules(dir: &Path) -> Result<Vec<PathBuf>, DriverError> {
    if !dir.is_dir() {
        return Err(DriverError::configuration(format!(
            "modules directory {} does not exist or is not a directory",
            dir.display()
        )));
    }

    let mut modules = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.map_err(|e| {
            DriverError::configuration(format!(
                "unable to scan modules directory {}: {e}",
                dir.display()
            ))
        })?;

        let is_module = entry.file_type().is_file()
            && entry
                .path()
                .extension()
                .is_some_and(|ext| ext == MODULE_EXTENSION);

        if is_module {
            modules.push(entry.into_path());
        }
    }

    modules.sort();
    Ok(modules)
}
