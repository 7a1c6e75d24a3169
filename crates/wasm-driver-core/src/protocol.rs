//! The per-task call protocol.
//!
//! Every task runs the same sequence against its backend:
//!
//! 1. [`resolve_module`]: cache lookup, falling back to disk + compile + insert
//! 2. [`execute`]: fresh context, optional input staging, entry call, exit result
//!
//! Per-task failures never escape as errors: they are folded into a
//! [`ExitResult`] so a broken module only terminates its own task.

use std::path::Path;
use std::time::SystemTime;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use wasm_driver_common::{
    BufferError, CallError, DriverError, IoBufferConfig, TaskConfig, TaskFault,
};

use crate::backend::{EngineBackend, ExecutionContext, InterruptHandle};
use crate::cache::{CachedModule, ModuleCache};

/// Why a task reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitCause {
    /// The entry function returned.
    Completed,
    /// Staging or the entry call failed.
    Faulted,
    /// A stop request interrupted the task.
    Stopped,
}

impl std::fmt::Display for ExitCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitCause::Completed => write!(f, "completed"),
            ExitCause::Faulted => write!(f, "faulted"),
            ExitCause::Stopped => write!(f, "stopped"),
        }
    }
}

/// Terminal outcome of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitResult {
    /// Why the task exited.
    pub cause: ExitCause,

    /// Process-style exit code: zero only for [`ExitCause::Completed`].
    pub exit_code: i32,

    /// Human-readable cause, empty on success.
    pub message: String,

    /// Values returned by the entry function.
    pub return_values: Vec<i64>,

    /// When the task exited.
    pub finished_at: SystemTime,
}

impl ExitResult {
    /// Exit code of a completed task.
    pub const SUCCESS_CODE: i32 = 0;

    /// Exit code of a faulted task.
    pub const FAULT_CODE: i32 = 1;

    /// Exit code of a stopped task (128 + SIGTERM).
    pub const STOPPED_CODE: i32 = 143;

    /// The entry function returned `return_values`.
    pub fn completed(return_values: Vec<i64>) -> Self {
        Self {
            cause: ExitCause::Completed,
            exit_code: Self::SUCCESS_CODE,
            message: String::new(),
            return_values,
            finished_at: SystemTime::now(),
        }
    }

    /// The task failed with `fault`.
    pub fn faulted(fault: &TaskFault) -> Self {
        Self::failed(fault.to_string())
    }

    /// The task failed for a reason outside the call protocol.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            cause: ExitCause::Faulted,
            exit_code: Self::FAULT_CODE,
            message: message.into(),
            return_values: Vec::new(),
            finished_at: SystemTime::now(),
        }
    }

    /// The task was stopped.
    pub fn stopped(message: impl Into<String>) -> Self {
        Self {
            cause: ExitCause::Stopped,
            exit_code: Self::STOPPED_CODE,
            message: message.into(),
            return_values: Vec::new(),
            finished_at: SystemTime::now(),
        }
    }

    /// Returns `true` if the entry function returned.
    pub fn is_success(&self) -> bool {
        self.cause == ExitCause::Completed
    }

    /// Returns `true` if the task was stopped.
    pub fn is_stopped(&self) -> bool {
        self.cause == ExitCause::Stopped
    }
}

/// Resolve the module at `path`, through the cache when one is configured.
///
/// On a miss the module is loaded by `backend` and inserted, so later runs
/// of the same path skip the disk read and compilation.
///
/// # Errors
///
/// Returns the backend's load error naming `path`.
#[instrument(skip(cache, backend), fields(module = %path.display()))]
pub fn resolve_module(
    cache: Option<&ModuleCache>,
    backend: &dyn EngineBackend,
    path: &Path,
) -> Result<CachedModule, DriverError> {
    let Some(cache) = cache else {
        return backend.load_module(path);
    };

    if let Some(module) = cache.get(path) {
        debug!("Module cache hit");
        return Ok(module);
    }

    debug!("Module cache miss");
    let module = backend.load_module(path)?;
    cache.put(module.clone());
    Ok(module)
}

/// Run a resolved module to completion.
///
/// Blocks the calling thread for the whole guest execution; callers run it
/// on a thread dedicated to the task. A stop observed before the entry
/// function returns yields [`ExitCause::Stopped`]; a return that races a
/// late stop still counts as completed.
#[instrument(skip_all, fields(task_id = %task_id, module = %module.key().display()))]
pub fn execute(
    backend: &dyn EngineBackend,
    task_id: &str,
    module: &CachedModule,
    config: &TaskConfig,
    interrupt: &InterruptHandle,
) -> ExitResult {
    let result = match run(backend, task_id, module, config, interrupt) {
        Ok(Some(values)) => ExitResult::completed(values),
        Ok(None) => ExitResult::stopped("task stopped before the entry call"),
        Err(fault) if fault.is_interrupted() || interrupt.is_requested() => {
            ExitResult::stopped(format!("task stopped: {fault}"))
        }
        Err(fault) => ExitResult::faulted(&fault),
    };

    info!(
        cause = %result.cause,
        exit_code = result.exit_code,
        message = %result.message,
        "Task execution finished"
    );

    result
}

/// Steps 2 to 4 of the protocol.
///
/// Returns `Ok(None)` when a pending stop is observed between steps.
fn run(
    backend: &dyn EngineBackend,
    task_id: &str,
    module: &CachedModule,
    config: &TaskConfig,
    interrupt: &InterruptHandle,
) -> Result<Option<Vec<i64>>, TaskFault> {
    let mut context = backend.new_context(task_id, module, interrupt)?;

    // The deadline is armed now; earlier stops only show up in the flag.
    if interrupt.is_requested() {
        return Ok(None);
    }

    if config.io_buffer.enabled {
        stage_input(context.as_mut(), &config.io_buffer)?;

        if interrupt.is_requested() {
            return Ok(None);
        }
    }

    let entry = &config.main;
    debug!(function = %entry.entry_function_name, args = ?entry.args, "Calling entry function");

    let values = context.call(&entry.entry_function_name, &entry.args)?;
    Ok(Some(values))
}

/// Allocate a guest buffer and copy the input value into it.
///
/// Returns the offset the input was written at.
fn stage_input(
    context: &mut dyn ExecutionContext,
    buffer: &IoBufferConfig,
) -> Result<u64, BufferError> {
    let function = buffer.allocator_function_name.as_str();
    let input = buffer.input_value.as_bytes();

    if input.len() > buffer.size as usize {
        warn!(
            input_len = input.len(),
            buffer_size = buffer.size,
            "Input value is larger than the configured buffer size"
        );
    }

    let returned = context.call(function, &buffer.args).map_err(|e| match e {
        CallError::MissingFunction { function } => BufferError::MissingAllocator { function },
        other => BufferError::Allocator(other),
    })?;

    let offset = *returned.first().ok_or_else(|| {
        BufferError::Allocator(CallError::signature(function, "allocator returned no value"))
    })?;

    let offset = u64::try_from(offset).map_err(|_| BufferError::InvalidOffset {
        function: function.to_string(),
        offset,
    })?;

    context.write_memory(offset, input)?;

    debug!(offset, len = input.len(), "Input staged in guest memory");

    Ok(offset)
}
