//! Task configuration supplied by the orchestrator.
//!
//! This module defines the per-task structures:
//! - [`TaskConfig`]: Module path, input buffer and entry function
//! - [`IoBufferConfig`]: How input is staged into guest memory
//! - [`MainConfig`]: The entry function and its arguments
//! - [`TaskDescriptor`]: A task configuration bound to its identifier

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::DriverError;

/// Configuration of a single task.
///
/// # Example
///
/// ```toml
/// modulePath = "/opt/wasm/filter.wasm"
///
/// [ioBuffer]
/// enabled = true
/// inputValue = '{"line":"test"}'
/// allocatorFunctionName = "alloc"
/// args = [4096]
///
/// [main]
/// entryFunctionName = "handle_buffer"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    /// Filesystem path of the WebAssembly module.
    pub module_path: PathBuf,

    /// Input staging configuration.
    #[serde(default)]
    pub io_buffer: IoBufferConfig,

    /// Entry function configuration.
    #[serde(default)]
    pub main: MainConfig,
}

impl TaskConfig {
    /// Create a task configuration for a module with default buffer and entry settings.
    pub fn new(module_path: impl Into<PathBuf>) -> Self {
        Self {
            module_path: module_path.into(),
            io_buffer: IoBufferConfig::default(),
            main: MainConfig::default(),
        }
    }

    /// Set the entry function and its arguments.
    #[must_use]
    pub fn with_entry(mut self, name: impl Into<String>, args: Vec<i64>) -> Self {
        self.main = MainConfig {
            entry_function_name: name.into(),
            args,
        };
        self
    }

    /// Enable input staging with the given value.
    #[must_use]
    pub fn with_input(mut self, input_value: impl Into<String>) -> Self {
        self.io_buffer.enabled = true;
        self.io_buffer.input_value = input_value.into();
        self
    }

    /// Load a task configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DriverError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DriverError::configuration(format!(
                "failed to read task config '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse a task configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, DriverError> {
        toml::from_str(content)
            .map_err(|e| DriverError::configuration(format!("failed to parse task config: {e}")))
    }
}

/// Input buffer staging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IoBufferConfig {
    /// Stage the input value before the entry call.
    #[serde(default)]
    pub enabled: bool,

    /// Declared buffer length in guest memory.
    ///
    /// Informational; the write is bounded by guest memory, not by this value.
    #[serde(default = "defaults::buffer_size")]
    pub size: u32,

    /// Raw value written into the guest buffer.
    #[serde(default)]
    pub input_value: String,

    /// Exported function returning the buffer offset.
    #[serde(
        alias = "IOBufFuncName",
        default = "defaults::allocator_function_name"
    )]
    pub allocator_function_name: String,

    /// Arguments passed to the allocator function.
    #[serde(default)]
    pub args: Vec<i64>,
}

impl Default for IoBufferConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size: defaults::buffer_size(),
            input_value: String::new(),
            allocator_function_name: defaults::allocator_function_name(),
            args: Vec::new(),
        }
    }
}

/// Entry function configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MainConfig {
    /// Exported function invoked as the task's unit of work.
    #[serde(alias = "mainFuncName", default = "defaults::entry_function_name")]
    pub entry_function_name: String,

    /// Arguments passed to the entry function.
    #[serde(default)]
    pub args: Vec<i64>,
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            entry_function_name: defaults::entry_function_name(),
            args: Vec::new(),
        }
    }
}

/// A task configuration bound to its orchestrator-assigned identifier.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TaskDescriptor {
    /// Orchestrator-assigned task identifier.
    pub id: String,

    /// Task configuration.
    pub config: TaskConfig,
}

impl TaskDescriptor {
    /// Create a new task descriptor.
    pub fn new(id: impl Into<String>, config: TaskConfig) -> Self {
        Self {
            id: id.into(),
            config,
        }
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn buffer_size() -> u32 {
        4096
    }

    pub fn allocator_function_name() -> String {
        "alloc".to_string()
    }

    pub fn entry_function_name() -> String {
        "handle_buffer".to_string()
    }
}
