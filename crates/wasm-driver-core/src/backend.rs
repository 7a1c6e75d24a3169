//! Engine backend abstraction.
//!
//! An [`EngineBackend`] is the only place runtime-specific code lives. The
//! module cache and the call protocol are written against these traits:
//!
//! - [`EngineBackend`]: load a module into a cache artifact, create execution contexts
//! - [`ExecutionContext`]: an instantiated module that can be called and written to
//! - [`InterruptHandle`]: a per-task stop request wired to the backend's preemption
//!
//! Backends are selected by [`BackendKind`] through [`create_backend`]; there is
//! no registration step, so the set of available backends is fixed at compile time.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;
use wasmtime::Linker;

use wasm_driver_common::{BackendKind, BufferError, CallError, DriverError, EngineConfig};

use crate::cache::CachedModule;
use crate::instance::WasmtimeContext;
use crate::module::CompiledModule;
use crate::store::TaskContext;
use crate::WasmEngine;

/// A WebAssembly runtime able to run tasks.
///
/// Implementations must be cheap to share: one backend instance serves every
/// task and the cache warm-up.
pub trait EngineBackend: Send + Sync + fmt::Debug {
    /// The kind of this backend.
    fn kind(&self) -> BackendKind;

    /// Read, compile and serialize the module at `path`.
    ///
    /// # Errors
    ///
    /// Returns a load error naming `path` on any failure.
    fn load_module(&self, path: &Path) -> Result<CachedModule, DriverError>;

    /// Create a handle that can interrupt a context created with it.
    fn interrupt_handle(&self) -> InterruptHandle;

    /// Instantiate a cached module in a fresh, isolated context.
    ///
    /// The context is armed so that once `interrupt` fires, an in-progress
    /// call aborts at its next preemption checkpoint.
    fn new_context(
        &self,
        task_id: &str,
        module: &CachedModule,
        interrupt: &InterruptHandle,
    ) -> Result<Box<dyn ExecutionContext>, CallError>;
}

/// An instantiated module owned by a single task.
pub trait ExecutionContext: Send {
    /// Call an exported function with integer arguments.
    ///
    /// Returns the integer results of the function.
    fn call(&mut self, function: &str, args: &[i64]) -> Result<Vec<i64>, CallError>;

    /// Write `bytes` into guest memory starting at `offset`.
    fn write_memory(&mut self, offset: u64, bytes: &[u8]) -> Result<(), BufferError>;

    /// Read `len` bytes of guest memory starting at `offset`.
    fn read_memory(&self, offset: u64, len: usize) -> Result<Vec<u8>, BufferError>;

    /// Current size of guest memory in bytes, if the module exports one.
    fn memory_size(&self) -> Option<usize>;
}

/// A cooperative stop request for one task.
///
/// Cloning shares the request. [`interrupt`](Self::interrupt) sets the flag
/// and fires the backend trigger once; the running call observes the flag at
/// its next preemption checkpoint.
#[derive(Clone)]
pub struct InterruptHandle {
    requested: Arc<AtomicBool>,
    trigger: Arc<dyn Fn() + Send + Sync>,
}

impl InterruptHandle {
    /// Create a handle with a backend-specific trigger.
    pub fn new(trigger: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            trigger: Arc::new(trigger),
        }
    }

    /// Request the interruption.
    ///
    /// Returns `false` if it had already been requested.
    pub fn interrupt(&self) -> bool {
        if self.requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        (self.trigger)();
        true
    }

    /// Returns `true` once an interruption was requested.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("requested", &self.is_requested())
            .finish_non_exhaustive()
    }
}

/// Create the backend selected by `config`.
///
/// # Errors
///
/// Returns a configuration error if the backend cannot be initialized.
pub fn create_backend(config: &EngineConfig) -> Result<Arc<dyn EngineBackend>, DriverError> {
    match config.backend {
        BackendKind::Wasmtime => Ok(Arc::new(WasmtimeBackend::new(config)?)),
    }
}

/// Wasmtime backend.
///
/// Preemption uses epoch interruption: every store has a one-tick deadline
/// and a stop request bumps the shared engine epoch.
pub struct WasmtimeBackend {
    engine: WasmEngine,
    linker: Linker<TaskContext>,
}

impl WasmtimeBackend {
    /// Create a new Wasmtime backend.
    pub fn new(config: &EngineConfig) -> Result<Self, DriverError> {
        let engine = WasmEngine::new(config)?;
        let linker = Linker::new(engine.inner());
        Ok(Self { engine, linker })
    }

    /// Get the underlying engine.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }
}

impl EngineBackend for WasmtimeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Wasmtime
    }

    fn load_module(&self, path: &Path) -> Result<CachedModule, DriverError> {
        let compiled = CompiledModule::from_file(self.engine.inner(), path)?;
        let cached = compiled.to_cached(path)?;

        debug!(
            module = %path.display(),
            artifact_len = cached.artifact().len(),
            "Module serialized"
        );

        Ok(cached)
    }

    fn interrupt_handle(&self) -> InterruptHandle {
        let engine = self.engine.clone();
        InterruptHandle::new(move || engine.increment_epoch())
    }

    fn new_context(
        &self,
        task_id: &str,
        module: &CachedModule,
        interrupt: &InterruptHandle,
    ) -> Result<Box<dyn ExecutionContext>, CallError> {
        if module.backend() != BackendKind::Wasmtime {
            return Err(CallError::instantiation(format!(
                "module {} was compiled by the {} backend",
                module.key().display(),
                module.backend()
            )));
        }

        let compiled = CompiledModule::from_cached(self.engine.inner(), module)
            .map_err(|e| CallError::instantiation(e.to_string()))?;

        let context =
            WasmtimeContext::instantiate(&self.engine, &self.linker, &compiled, task_id, interrupt)?;
        Ok(Box::new(context))
    }
}

impl fmt::Debug for WasmtimeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmtimeBackend")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
