//! Driver orchestration.
//!
//! [`WasmDriver`] owns the configuration, the engine backend, the module
//! cache, and the task registry, and translates the orchestrator's
//! lifecycle calls into operations on them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use wasm_driver_common::{DriverError, PluginConfig, TaskDescriptor};
use wasm_driver_core::{
    CacheStats, EngineBackend, ExitResult, ModuleCache, create_backend, resolve_module,
};

use crate::events::{EventBus, TaskEvent};
use crate::info::{
    Capabilities, Fingerprint, HealthState, PluginInfo, TASK_HANDLE_VERSION, TaskHandle,
    TaskResourceUsage,
};
use crate::registry::TaskRegistry;
use crate::task::{Task, TaskStatus};

/// Interval between fingerprint samples.
pub const FINGERPRINT_PERIOD: Duration = Duration::from_secs(30);

/// WebAssembly task driver.
pub struct WasmDriver {
    config: PluginConfig,
    backend: Arc<dyn EngineBackend>,
    cache: Option<Arc<ModuleCache>>,
    registry: TaskRegistry,
    events: EventBus,
    shutdown: CancellationToken,
}

impl WasmDriver {
    /// Create a driver from a plugin configuration.
    ///
    /// Validates the configuration, builds the backend and module cache, and
    /// warms the cache when pre-caching is enabled. Warm-up compiles every
    /// module on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid configuration, or the
    /// error of a failed warm-up. No driver exists in either case.
    #[instrument(skip_all, fields(backend = %config.engine.backend, cache = %config.cache.kind))]
    pub fn new(config: PluginConfig) -> Result<Self, DriverError> {
        config.validate()?;

        let backend = create_backend(&config.engine)?;
        let cache = ModuleCache::from_config(&config.cache)?.map(Arc::new);

        if let Some(cache) = &cache {
            let pre_cache = &config.cache.pre_cache;
            if pre_cache.enabled {
                let dir = pre_cache.modules_dir.as_deref().ok_or_else(|| {
                    DriverError::configuration("cache.preCache.modulesDir must be set")
                })?;
                cache.warm(dir, backend.as_ref())?;
            }
        } else if config.cache.pre_cache.enabled {
            warn!("Pre-caching is enabled but the module cache is disabled; skipping warm-up");
        }

        info!(
            cache_enabled = cache.is_some(),
            cache_size = config.cache.size,
            "Driver initialized"
        );

        Ok(Self {
            config,
            backend,
            cache,
            registry: TaskRegistry::new(),
            events: EventBus::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Plugin identification.
    pub fn plugin_info(&self) -> PluginInfo {
        PluginInfo::default()
    }

    /// Optional features supported by the driver.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// The active plugin configuration.
    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// The engine backend shared by every task.
    pub fn backend(&self) -> &Arc<dyn EngineBackend> {
        &self.backend
    }

    /// The task registry.
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Module cache counters, if the cache is enabled.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|cache| cache.stats())
    }

    /// Build one fingerprint sample.
    pub fn fingerprint_sample(&self) -> Fingerprint {
        let mut attributes = BTreeMap::new();
        attributes.insert("driver.wasm".to_string(), "true".to_string());
        attributes.insert(
            "driver.wasm.version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        attributes.insert(
            "driver.wasm.backend".to_string(),
            self.backend.kind().to_string(),
        );
        if let Some(cache) = &self.cache {
            attributes.insert("driver.wasm.cache.type".to_string(), cache.kind().to_string());
            attributes.insert(
                "driver.wasm.cache.size".to_string(),
                cache.capacity().to_string(),
            );
        }

        Fingerprint {
            health: HealthState::Healthy,
            description: "healthy".to_string(),
            attributes,
        }
    }

    /// Stream fingerprint samples.
    ///
    /// The first sample is sent immediately, then one every
    /// [`FINGERPRINT_PERIOD`] until `cancel` fires, the driver shuts down,
    /// or the receiver is dropped. Must be called within a Tokio runtime.
    pub fn fingerprint(&self, cancel: CancellationToken) -> mpsc::Receiver<Fingerprint> {
        let (tx, rx) = mpsc::channel(1);
        let sample = self.fingerprint_sample();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FINGERPRINT_PERIOD);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if tx.send(sample.clone()).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Fingerprint stream closed");
        });

        rx
    }

    /// Start a task.
    ///
    /// The identifier is reserved before the module is loaded, so of two
    /// concurrent starts with one identifier exactly one proceeds. A load
    /// failure releases the reservation, and so does dropping the returned
    /// future before the task runs.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::DuplicateTask`] if the identifier is in use,
    /// the load error of the module, or a state error if the task was
    /// destroyed while its module was loading.
    #[instrument(skip_all, fields(task_id = %descriptor.id))]
    pub async fn start_task(&self, descriptor: TaskDescriptor) -> Result<TaskHandle, DriverError> {
        let config = descriptor.config.clone();
        let task = Arc::new(Task::new(
            descriptor,
            self.backend.interrupt_handle(),
            self.events.clone(),
        ));

        self.registry.register(Arc::clone(&task))?;
        let reservation = Reservation::new(&self.registry, &task);

        let module = {
            let backend = Arc::clone(&self.backend);
            let cache = self.cache.clone();
            let path = config.module_path.clone();
            tokio::task::spawn_blocking(move || {
                resolve_module(cache.as_deref(), backend.as_ref(), &path)
            })
            .await
            .map_err(|e| DriverError::load(&config.module_path, format!("loader aborted: {e}")))
            .and_then(|resolved| resolved)
        };

        let module = match module {
            Ok(module) => module,
            Err(e) => {
                warn!(error = %e, "Task start failed");
                task.finish(ExitResult::failed(e.to_string()));
                return Err(e);
            }
        };

        task.start(Arc::clone(&self.backend), module)?;
        reservation.release();
        self.events.publish(TaskEvent::new(task.id(), "Task started"));

        Ok(TaskHandle {
            version: TASK_HANDLE_VERSION,
            task_id: task.id().to_string(),
            started_at: task.started_at(),
            config,
        })
    }

    /// Re-attach to a task after a driver restart.
    ///
    /// Task state is not persisted, so there is nothing to reconstruct; the
    /// call is accepted and ignored.
    pub fn recover_task(&self, handle: &TaskHandle) -> Result<(), DriverError> {
        debug!(task_id = %handle.task_id, "Task recovery is a no-op");
        Ok(())
    }

    /// Wait for a task to exit.
    ///
    /// The receiver yields exactly one exit result. It is closed without a
    /// value if `cancel` fires or the driver shuts down first; the task keeps
    /// running. Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotFound`] for an unknown identifier.
    pub fn wait_task(
        &self,
        task_id: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ExitResult>, DriverError> {
        let task = self.registry.lookup(task_id)?;
        let shutdown = self.shutdown.clone();
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            tokio::select! {
                result = task.wait() => match result {
                    Ok(result) => {
                        // The caller may have stopped listening.
                        let _ = tx.send(result).await;
                    }
                    Err(e) => warn!(task_id = %task.id(), error = %e, "Wait failed"),
                },
                () = cancel.cancelled() => debug!(task_id = %task.id(), "Wait cancelled"),
                () = shutdown.cancelled() => {}
            }
        });

        Ok(rx)
    }

    /// Stop a task. The signal is ignored.
    ///
    /// Stopping a task that has already exited is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotFound`] for an unknown identifier.
    pub fn stop_task(&self, task_id: &str, signal: Option<&str>) -> Result<(), DriverError> {
        let task = self.registry.lookup(task_id)?;

        if task.stop() {
            debug!(task_id, signal, "Stop requested");
            self.events.publish(TaskEvent::new(task_id, "Task stop requested"));
        }

        Ok(())
    }

    /// Destroy a task, removing it from the registry.
    ///
    /// A task that has not exited is only destroyed with `force`, which
    /// stops it first.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotFound`] for an unknown identifier and
    /// [`DriverError::TaskRunning`] for a live task without `force`.
    pub fn destroy_task(&self, task_id: &str, force: bool) -> Result<(), DriverError> {
        let task = self.registry.lookup(task_id)?;

        if task.exit_result().is_none() {
            if !force {
                return Err(DriverError::task_running(task_id));
            }
            self.stop_task(task_id, None)?;
        }

        self.registry.remove(task_id)?;
        info!(task_id, force, "Task destroyed");

        Ok(())
    }

    /// Snapshot a task.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotFound`] for an unknown identifier.
    pub fn inspect_task(&self, task_id: &str) -> Result<TaskStatus, DriverError> {
        Ok(self.registry.lookup(task_id)?.status())
    }

    /// Stream resource usage samples of a task.
    ///
    /// Guest resources are not accounted, so every sample is empty. Samples
    /// are sent every `interval` until `cancel` fires, the driver shuts down,
    /// or the receiver is dropped. Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotFound`] for an unknown identifier and a
    /// configuration error for a zero interval.
    pub fn task_stats(
        &self,
        task_id: &str,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TaskResourceUsage>, DriverError> {
        self.registry.lookup(task_id)?;

        if interval.is_zero() {
            return Err(DriverError::configuration("stats interval must be > 0"));
        }

        let shutdown = self.shutdown.clone();
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if tx.send(TaskResourceUsage::empty()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    /// Subscribe to task events.
    pub fn task_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Deliver a signal to a task. Not supported.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotFound`] for an unknown identifier, otherwise
    /// [`DriverError::Unsupported`].
    pub fn signal_task(&self, task_id: &str, signal: &str) -> Result<(), DriverError> {
        self.registry.lookup(task_id)?;
        debug!(task_id, signal, "Signal rejected");
        Err(DriverError::unsupported("SignalTask"))
    }

    /// Execute a command inside a task. Not supported.
    ///
    /// # Errors
    ///
    /// Always returns [`DriverError::Unsupported`].
    pub fn exec_task(&self, task_id: &str, command: &[String]) -> Result<(), DriverError> {
        debug!(task_id, ?command, "Exec rejected");
        Err(DriverError::unsupported("ExecTask"))
    }

    /// Stop every live task and close every stream.
    pub fn shutdown(&self) {
        for task in self.registry.tasks() {
            task.stop();
        }
        self.shutdown.cancel();
        info!(tasks = self.registry.len(), "Driver shut down");
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// A registered task that has not started running yet.
///
/// Dropped while armed, it stops the task and removes it from the registry,
/// so an abandoned start never leaves a `Starting` task behind.
struct Reservation<'a> {
    registry: &'a TaskRegistry,
    task: &'a Arc<Task>,
    armed: bool,
}

impl<'a> Reservation<'a> {
    fn new(registry: &'a TaskRegistry, task: &'a Arc<Task>) -> Self {
        Self {
            registry,
            task,
            armed: true,
        }
    }

    /// The task is running; keep it registered.
    fn release(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.task.stop();
        if self.registry.discard(self.task) {
            debug!(task_id = %self.task.id(), "Task reservation released");
        }
    }
}

impl std::fmt::Debug for WasmDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmDriver")
            .field("backend", &self.backend.kind())
            .field("cache", &self.cache)
            .field("tasks", &self.registry.len())
            .finish_non_exhaustive()
    }
}
