//! Engine, module cache, and call protocol for the WebAssembly task driver.
//!
//! This crate provides the execution side of a task:
//! - [`WasmEngine`]: Shared Wasmtime engine with epoch interruption
//! - [`EngineBackend`]: Runtime abstraction selected by configuration
//! - [`ModuleCache`]: Serialized modules with pluggable eviction and expiration
//! - [`protocol`]: Module resolution and the staging + entry-call sequence
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   EngineBackend                         │
//! │  (One per driver, shared by every task)                 │
//! │  - WasmEngine: epoch interruption, Cranelift            │
//! │  - load_module: read + compile + serialize              │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    ModuleCache                          │
//! │  (Shared, one lock)                                     │
//! │  - CachedModule artifacts keyed by path                 │
//! │  - LFU / LRU / ARC / simple eviction, TTL               │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          ExecutionContext (Store + Instance)            │
//! │  (Per task, isolated)                                   │
//! │  - Epoch deadline armed with the task's InterruptHandle │
//! │  - Input staging into guest memory                      │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod cache;
pub mod engine;
pub mod eviction;
pub mod instance;
pub mod module;
pub mod protocol;
pub mod store;

pub use backend::{
    EngineBackend, ExecutionContext, InterruptHandle, WasmtimeBackend, create_backend,
};
pub use cache::{CacheStats, CachedModule, ModuleCache};
pub use engine::WasmEngine;
pub use eviction::{EvictionPolicy, ModuleKey, new_policy};
pub use instance::WasmtimeContext;
pub use module::CompiledModule;
pub use protocol::{ExitCause, ExitResult, execute, resolve_module};
pub use store::{TaskContext, create_store};
