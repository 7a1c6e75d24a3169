//! Common types, errors, and configuration for the WebAssembly task driver.
//!
//! This crate provides shared functionality used across the workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Plugin configuration (engine backend, module cache)
//! - Task configuration as decoded from the orchestrator

pub mod config;
pub mod error;
pub mod task;

pub use config::{
    BackendKind, CacheConfig, EngineConfig, EvictionKind, ExpirationConfig, PluginConfig,
    PreCacheConfig,
};
pub use error::{BufferError, CallError, DriverError, TaskFault};
pub use task::{IoBufferConfig, MainConfig, TaskConfig, TaskDescriptor};
