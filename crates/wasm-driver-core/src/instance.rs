//! WebAssembly instance execution for the Wasmtime backend.
//!
//! This module provides [`WasmtimeContext`], one instantiated module bound to
//! its own store. It implements the [`ExecutionContext`] capability:
//!
//! 1. Look up an exported function and check the arguments against its type
//! 2. Call it, classifying traps and interruptions
//! 3. Read and write guest linear memory with bounds checks

use wasmtime::{Export, Instance, Linker, Memory, Store, Trap, Val, ValType};

use tracing::{debug, warn};
use wasm_driver_common::{BufferError, CallError};

use crate::WasmEngine;
use crate::backend::{ExecutionContext, InterruptHandle};
use crate::module::CompiledModule;
use crate::store::{TaskContext, create_store};

/// Name of the start function reported when instantiation is interrupted.
const START_FUNCTION: &str = "<start>";

/// An instantiated module and its isolated store.
pub struct WasmtimeContext {
    store: Store<TaskContext>,
    instance: Instance,
    memory: Option<Memory>,
}

impl WasmtimeContext {
    /// Instantiate `module` in a fresh store armed with `interrupt`.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Instantiation`] if linking fails, or
    /// [`CallError::Interrupted`] if the module's start function was stopped.
    pub fn instantiate(
        engine: &WasmEngine,
        linker: &Linker<TaskContext>,
        module: &CompiledModule,
        task_id: &str,
        interrupt: &InterruptHandle,
    ) -> Result<Self, CallError> {
        let mut store = create_store(engine, task_id.to_string(), interrupt);

        let instance = linker
            .instantiate(&mut store, module.inner())
            .map_err(|e| match classify_error(START_FUNCTION, &e) {
                err @ CallError::Interrupted { .. } => err,
                _ => CallError::instantiation(format!("{e:#}")),
            })?;

        // Prefer the conventional export name, fall back to any exported memory.
        let memory = instance.get_memory(&mut store, "memory").or_else(|| {
            instance
                .exports(&mut store)
                .find_map(Export::into_memory)
        });

        debug!(
            task_id,
            content_hash = %module.content_hash(),
            has_memory = memory.is_some(),
            "Module instantiated"
        );

        Ok(Self {
            store,
            instance,
            memory,
        })
    }

    /// Get the task context of this store.
    pub fn task_context(&self) -> &TaskContext {
        self.store.data()
    }
}

impl ExecutionContext for WasmtimeContext {
    fn call(&mut self, function: &str, args: &[i64]) -> Result<Vec<i64>, CallError> {
        let func = self
            .instance
            .get_func(&mut self.store, function)
            .ok_or_else(|| CallError::missing_function(function))?;

        let ty = func.ty(&self.store);

        if ty.params().len() != args.len() {
            return Err(CallError::signature(
                function,
                format!(
                    "expected {} arguments, got {}",
                    ty.params().len(),
                    args.len()
                ),
            ));
        }

        let params = ty
            .params()
            .zip(args)
            .enumerate()
            .map(|(index, (param, &arg))| to_val(function, index, &param, arg))
            .collect::<Result<Vec<_>, _>>()?;

        let mut results = vec![Val::I32(0); ty.results().len()];

        func.call(&mut self.store, &params, &mut results)
            .map_err(|e| classify_error(function, &e))?;

        results
            .iter()
            .map(|value| from_val(function, value))
            .collect()
    }

    fn write_memory(&mut self, offset: u64, bytes: &[u8]) -> Result<(), BufferError> {
        let memory = self.memory.ok_or(BufferError::MissingMemory)?;
        let memory_size = memory.data_size(&self.store);

        let out_of_bounds = || BufferError::OutOfBounds {
            offset,
            len: bytes.len(),
            memory_size,
        };

        let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
        memory
            .write(&mut self.store, start, bytes)
            .map_err(|_| out_of_bounds())
    }

    fn read_memory(&self, offset: u64, len: usize) -> Result<Vec<u8>, BufferError> {
        let memory = self.memory.ok_or(BufferError::MissingMemory)?;
        let memory_size = memory.data_size(&self.store);

        let out_of_bounds = || BufferError::OutOfBounds {
            offset,
            len,
            memory_size,
        };

        let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
        let mut buf = vec![0u8; len];
        memory
            .read(&self.store, start, &mut buf)
            .map_err(|_| out_of_bounds())?;
        Ok(buf)
    }

    fn memory_size(&self) -> Option<usize> {
        self.memory.map(|memory| memory.data_size(&self.store))
    }
}

impl std::fmt::Debug for WasmtimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmtimeContext")
            .field("task_id", &self.store.data().task_id)
            .field("has_memory", &self.memory.is_some())
            .finish_non_exhaustive()
    }
}

/// Convert an integer argument to the parameter's value type.
fn to_val(function: &str, index: usize, param: &ValType, arg: i64) -> Result<Val, CallError> {
    match param {
        ValType::I32 => i32::try_from(arg).map(Val::I32).map_err(|_| {
            CallError::signature(
                function,
                format!("argument {index} ({arg}) does not fit parameter type i32"),
            )
        }),
        ValType::I64 => Ok(Val::I64(arg)),
        other => Err(CallError::signature(
            function,
            format!("parameter {index} has unsupported type {other:?}"),
        )),
    }
}

/// Convert a result value to an integer.
fn from_val(function: &str, value: &Val) -> Result<i64, CallError> {
    match value {
        Val::I32(v) => Ok(i64::from(*v)),
        Val::I64(v) => Ok(*v),
        other => Err(CallError::signature(
            function,
            format!("unsupported result value {other:?}"),
        )),
    }
}

/// Classify a failed call as an interruption or a trap.
fn classify_error(function: &str, error: &wasmtime::Error) -> CallError {
    let trap = error.downcast_ref::<Trap>();

    if trap == Some(&Trap::Interrupt) {
        return CallError::Interrupted {
            function: function.to_string(),
        };
    }

    warn!(function, error = %error, "Guest call trapped");

    CallError::Trap {
        function: function.to_string(),
        message: error.to_string(),
        code: trap.map(|trap| format!("{trap:?}")),
    }
}
