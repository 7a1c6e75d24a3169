//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is shared by every task the driver runs. It is:
//! - Thread-safe and cheap to clone
//! - Configured with epoch interruption so a single task can be stopped
//! - The only engine that produces and consumes cached module artifacts

use std::sync::Arc;

use tracing::info;
use wasmtime::{Config, Engine, OptLevel};

use wasm_driver_common::{DriverError, EngineConfig};

/// Thread-safe WebAssembly engine wrapper.
///
/// Serialized modules are only valid for an engine with identical
/// settings, so the cache and every task store use this one engine.
///
/// # Configuration
///
/// - **Epoch Interruption**: every store gets a deadline of one tick; a stop
///   request bumps the epoch so the running call reaches its deadline
/// - **Synchronous execution**: calls run on a blocking thread per task
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if Wasmtime rejects the settings.
    pub fn new(config: &EngineConfig) -> Result<Self, DriverError> {
        let mut wasmtime_config = Config::new();

        // Required for per-task stop
        wasmtime_config.epoch_interruption(true);

        wasmtime_config.cranelift_opt_level(if config.optimize {
            OptLevel::Speed
        } else {
            OptLevel::None
        });

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            DriverError::configuration(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!(optimize = config.optimize, "Wasmtime engine initialized");

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Increment the epoch counter.
    ///
    /// Every store currently executing reaches its deadline and consults its
    /// interrupt flag; stores without a pending stop continue.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("backend", &self.config.backend)
            .field("optimize", &self.config.optimize)
            .finish_non_exhaustive()
    }
}
