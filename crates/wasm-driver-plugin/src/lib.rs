//! Task lifecycle for the WebAssembly task driver.
//!
//! This crate exposes the driver to a workload orchestrator. It handles:
//!
//! - Task state machine (starting, running, exited) and completion fan-out
//! - Task registry with duplicate and not-found detection
//! - Lifecycle calls: start, stop, destroy, inspect, wait, stats
//! - Fingerprint, stats, and event streams
//!
//! The transport carrying these calls is not part of this crate.
//!
//! # Quick Start
//!
//! ```ignore
//! use tokio_util::sync::CancellationToken;
//! use wasm_driver_common::{PluginConfig, TaskConfig, TaskDescriptor};
//! use wasm_driver_plugin::WasmDriver;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let driver = WasmDriver::new(PluginConfig::default())?;
//!
//!     let config = TaskConfig::new("/modules/sum.wasm").with_entry("sum", vec![1, 2]);
//!     driver.start_task(TaskDescriptor::new("task-1", config)).await?;
//!
//!     let mut exit = driver.wait_task("task-1", CancellationToken::new())?;
//!     println!("{:?}", exit.recv().await);
//!
//!     driver.destroy_task("task-1", false)?;
//!     Ok(())
//! }
//! ```

pub mod driver;
pub mod events;
pub mod info;
pub mod registry;
pub mod task;

pub use driver::{FINGERPRINT_PERIOD, WasmDriver};
pub use events::{EventBus, TaskEvent};
pub use info::{
    Capabilities, CpuUsage, Fingerprint, HealthState, MemoryUsage, PluginInfo, TaskHandle,
    TaskResourceUsage,
};
pub use registry::TaskRegistry;
pub use task::{Task, TaskState, TaskStatus};
