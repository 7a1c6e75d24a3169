//! WebAssembly module compilation and serialization.
//!
//! This module provides [`CompiledModule`], a wrapper around Wasmtime's [`Module`]
//! that handles compiling modules from disk, serializing them into cache
//! artifacts, and rebuilding them from those artifacts.
//!
//! # Artifact Lifecycle
//!
//! - **Miss**: read the file, compile it, serialize the result into a [`CachedModule`]
//! - **Hit**: deserialize the cached artifact, skipping both disk and compiler

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, instrument};
use wasmtime::{Engine, Module};

use wasm_driver_common::{BackendKind, DriverError};

use crate::cache::CachedModule;

/// A compiled WebAssembly module.
///
/// # Thread Safety
///
/// `CompiledModule` is thread-safe and can be shared across multiple instances.
#[derive(Clone)]
pub struct CompiledModule {
    /// The compiled Wasmtime module.
    inner: Module,

    /// Hash of the original module bytes.
    content_hash: String,

    /// When this module was compiled or deserialized.
    compiled_at: Instant,
}

impl CompiledModule {
    /// Read and compile a module from disk.
    ///
    /// Both the binary and the text format are accepted.
    ///
    /// # Errors
    ///
    /// Returns a load error naming `path` if the file cannot be read or compiled.
    #[instrument(skip(engine), fields(path = %path.display()))]
    pub fn from_file(engine: &Engine, path: &Path) -> Result<Self, DriverError> {
        let bytes = std::fs::read(path)
            .map_err(|e| DriverError::load(path, format!("unable to read file: {e}")))?;

        Self::from_bytes(engine, &bytes).map_err(|e| DriverError::load(path, e))
    }

    /// Compile a module from bytes.
    ///
    /// # Errors
    ///
    /// Returns the compiler diagnostic if the bytes are not a valid module.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, String> {
        let start = Instant::now();

        if bytes.is_empty() {
            return Err("Invalid Wasm: file is empty".to_string());
        }

        let module =
            Module::new(engine, bytes).map_err(|e| format!("Module compilation failed: {e:#}"))?;

        let content_hash = compute_hash(bytes);
        let duration = start.elapsed();

        info!(
            content_hash = %content_hash,
            duration_ms = duration.as_millis(),
            "Module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Compile a module from WAT (WebAssembly Text Format).
    ///
    /// This is primarily for testing purposes.
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, String> {
        Self::from_bytes(engine, wat.as_bytes())
    }

    /// Rebuild a module from a cached artifact.
    ///
    /// # Errors
    ///
    /// Returns a load error if the artifact is incompatible with `engine`.
    #[allow(unsafe_code)]
    #[instrument(skip(engine, cached), fields(module = %cached.key().display()))]
    pub fn from_cached(engine: &Engine, cached: &CachedModule) -> Result<Self, DriverError> {
        let start = Instant::now();

        // SAFETY: artifacts are only produced by `serialize` on an engine
        // built from the same configuration.
        let module = unsafe { Module::deserialize(engine, cached.artifact()) }.map_err(|e| {
            DriverError::load(cached.key(), format!("unable to deserialize module: {e}"))
        })?;

        debug!(
            content_hash = %cached.content_hash(),
            duration_us = start.elapsed().as_micros(),
            "Cached module deserialized"
        );

        Ok(Self {
            inner: module,
            content_hash: cached.content_hash().to_string(),
            compiled_at: Instant::now(),
        })
    }

    /// Serialize the compiled module into a cache artifact for `path`.
    ///
    /// # Errors
    ///
    /// Returns a load error naming `path` if serialization fails.
    pub fn to_cached(&self, path: &Path) -> Result<CachedModule, DriverError> {
        let artifact = self
            .inner
            .serialize()
            .map_err(|e| DriverError::load(path, format!("unable to serialize module: {e}")))?;

        Ok(CachedModule::new(
            path.to_path_buf(),
            BackendKind::Wasmtime,
            Bytes::from(artifact),
            self.content_hash.clone(),
        ))
    }

    /// Get the content hash of the original module bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Get the inner Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.inner
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
