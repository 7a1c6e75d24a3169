//! Error types for the WebAssembly task driver.
//!
//! This module defines the error hierarchy using `thiserror`:
//! - [`DriverError`]: Errors returned to the orchestrator or raised at startup
//! - [`TaskFault`]: Per-task failures folded into a faulted exit result
//! - [`BufferError`]: Failures while staging input into guest memory
//! - [`CallError`]: Failures while invoking a guest function

use std::io;
use std::path::Path;

use thiserror::Error;

/// Driver-level errors.
///
/// These are either fatal at startup (configuration, pre-cache) or
/// recoverable errors returned from a lifecycle call. None of them
/// terminate the driver process.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Invalid plugin configuration.
    #[error("Invalid configuration: {reason}")]
    Configuration {
        /// Description of the configuration error.
        reason: String,
    },

    /// A module could not be read, compiled, or serialized.
    #[error("Unable to load WASM module ({module}): {reason}")]
    Load {
        /// Path of the offending module.
        module: String,
        /// Description of the failure.
        reason: String,
    },

    /// No task is registered under the given identifier.
    #[error("Task not found: {task_id}")]
    NotFound {
        /// The unknown task identifier.
        task_id: String,
    },

    /// A task with the same identifier is already registered.
    #[error("Task with ID {task_id:?} already started")]
    DuplicateTask {
        /// The duplicated task identifier.
        task_id: String,
    },

    /// The task is still running and the operation requires it to have exited.
    #[error("Cannot destroy running task {task_id:?}")]
    TaskRunning {
        /// The running task identifier.
        task_id: String,
    },

    /// The task is not in a state that allows the requested transition.
    #[error("Invalid state for task {task_id:?}: {reason}")]
    InvalidState {
        /// The task identifier.
        task_id: String,
        /// Description of the state conflict.
        reason: String,
    },

    /// The driver does not implement the requested operation.
    #[error("This driver does not support {operation}")]
    Unsupported {
        /// The unsupported operation.
        operation: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl DriverError {
    /// Create a new `Configuration` error.
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a new `Load` error for the module at `path`.
    pub fn load(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::Load {
            module: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }

    /// Create a new `NotFound` error.
    pub fn not_found(task_id: impl Into<String>) -> Self {
        Self::NotFound {
            task_id: task_id.into(),
        }
    }

    /// Create a new `DuplicateTask` error.
    pub fn duplicate_task(task_id: impl Into<String>) -> Self {
        Self::DuplicateTask {
            task_id: task_id.into(),
        }
    }

    /// Create a new `TaskRunning` error.
    pub fn task_running(task_id: impl Into<String>) -> Self {
        Self::TaskRunning {
            task_id: task_id.into(),
        }
    }

    /// Create a new `InvalidState` error.
    pub fn invalid_state(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            task_id: task_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `Unsupported` error.
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Returns `true` if this error indicates an unknown task.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if this error is a state conflict the caller can recover from.
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateTask { .. } | Self::TaskRunning { .. } | Self::InvalidState { .. }
        )
    }

    /// Returns `true` if this error must block driver initialization.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::Load { .. })
    }
}

/// A failure that terminates a single task.
///
/// Task faults are reported through the task's exit result and never
/// affect the module cache or other tasks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskFault {
    /// Input staging into guest memory failed.
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// The entry function could not be invoked or did not return.
    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

/// Errors raised while staging the input buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// The allocator function is not exported by the module.
    #[error("allocator function '{function}' not found")]
    MissingAllocator {
        /// Name of the allocator function.
        function: String,
    },

    /// The allocator returned an offset that cannot address guest memory.
    #[error("allocator function '{function}' returned invalid offset {offset}")]
    InvalidOffset {
        /// Name of the allocator function.
        function: String,
        /// The offset that was returned.
        offset: i64,
    },

    /// The module does not export a linear memory.
    #[error("module does not export a memory")]
    MissingMemory,

    /// The write would exceed guest memory bounds.
    #[error("write of {len} bytes at offset {offset} exceeds guest memory of {memory_size} bytes")]
    OutOfBounds {
        /// Start of the write.
        offset: u64,
        /// Number of bytes to write.
        len: usize,
        /// Current size of guest memory.
        memory_size: usize,
    },

    /// Calling the allocator function failed.
    #[error("allocator call failed: {0}")]
    Allocator(CallError),
}

/// Errors raised while calling a guest function.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The function is not exported by the module.
    #[error("function '{function}' not found")]
    MissingFunction {
        /// Name of the function.
        function: String,
    },

    /// The supplied arguments or expected results do not match the function type.
    #[error("function '{function}' signature mismatch: {reason}")]
    Signature {
        /// Name of the function.
        function: String,
        /// Description of the mismatch.
        reason: String,
    },

    /// The module could not be instantiated.
    #[error("instantiation failed: {reason}")]
    Instantiation {
        /// Description of the failure.
        reason: String,
    },

    /// The guest trapped during execution.
    #[error("function '{function}' trapped: {message}")]
    Trap {
        /// Name of the function.
        function: String,
        /// Description of the trap.
        message: String,
        /// Trap code if available.
        code: Option<String>,
    },

    /// The call was aborted by the interruption mechanism.
    #[error("function '{function}' interrupted")]
    Interrupted {
        /// Name of the function.
        function: String,
    },
}

impl CallError {
    /// Create a new `MissingFunction` error.
    pub fn missing_function(function: impl Into<String>) -> Self {
        Self::MissingFunction {
            function: function.into(),
        }
    }

    /// Create a new `Signature` error.
    pub fn signature(function: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Signature {
            function: function.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `Instantiation` error.
    pub fn instantiation(reason: impl Into<String>) -> Self {
        Self::Instantiation {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the call was aborted by an interruption.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

impl TaskFault {
    /// Returns `true` if the fault was caused by an interruption.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Call(err) | Self::Buffer(BufferError::Allocator(err)) => err.is_interrupted(),
            Self::Buffer(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DriverError::not_found("task-1");
        assert_eq!(err.to_string(), "Task not found: task-1");

        let err = DriverError::duplicate_task("task-1");
        assert_eq!(err.to_string(), "Task with ID \"task-1\" already started");

        let err = DriverError::load("/tmp/mod.wasm", "bad magic");
        assert_eq!(
            err.to_string(),
            "Unable to load WASM module (/tmp/mod.wasm): bad magic"
        );
    }

    #[test]
    fn test_error_predicates() {
        assert!(DriverError::not_found("x").is_not_found());
        assert!(!DriverError::not_found("x").is_state_error());
        assert!(DriverError::duplicate_task("x").is_state_error());
        assert!(DriverError::task_running("x").is_state_error());
        assert!(DriverError::configuration("size").is_fatal());
        assert!(DriverError::load("m.wasm", "io").is_fatal());
        assert!(!DriverError::unsupported("exec").is_fatal());
    }

    #[test]
    fn test_fault_names_function() {
        let fault: TaskFault = CallError::missing_function("handle_buffer").into();
        assert!(fault.to_string().contains("handle_buffer"));

        let fault: TaskFault = BufferError::MissingAllocator {
            function: "alloc".into(),
        }
        .into();
        assert!(fault.to_string().contains("alloc"));
    }

    #[test]
    fn test_fault_is_interrupted() {
        let interrupted = CallError::Interrupted {
            function: "main".into(),
        };
        assert!(TaskFault::Call(interrupted.clone()).is_interrupted());
        assert!(TaskFault::Buffer(BufferError::Allocator(interrupted)).is_interrupted());
        assert!(!TaskFault::Buffer(BufferError::MissingMemory).is_interrupted());
    }
}
