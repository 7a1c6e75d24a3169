//! Per-task execution context and store management.
//!
//! This module provides:
//! - [`TaskContext`]: Per-task state carried inside the Wasmtime store
//! - [`create_store`]: Store construction with the interruption deadline armed

use std::time::{Duration, Instant};

use wasmtime::{Store, Trap, UpdateDeadline};

use crate::WasmEngine;
use crate::backend::InterruptHandle;

/// Number of epoch ticks a store may run before consulting its interrupt flag.
pub const DEADLINE_TICKS: u64 = 1;

/// Per-task execution context.
///
/// Created once per task and dropped together with its store after the
/// call protocol finishes.
#[derive(Debug)]
pub struct TaskContext {
    /// Orchestrator-assigned task identifier, for tracing.
    pub task_id: String,

    /// Number of epoch deadlines reached without a pending stop.
    pub deadline_checks: u64,

    /// Execution start time.
    start_time: Instant,
}

impl TaskContext {
    /// Create a new task context with the given task ID.
    pub fn new(task_id: String) -> Self {
        Self {
            task_id,
            deadline_checks: 0,
            start_time: Instant::now(),
        }
    }

    /// Get elapsed time since the context was created.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Create a new Wasmtime store for one task.
///
/// The store's epoch deadline is [`DEADLINE_TICKS`] past the current epoch.
/// When it is reached the store traps with [`Trap::Interrupt`] if `interrupt`
/// was requested; otherwise it extends the deadline and keeps running, so
/// ticks caused by other tasks' stops are harmless.
pub fn create_store(
    engine: &WasmEngine,
    task_id: String,
    interrupt: &InterruptHandle,
) -> Store<TaskContext> {
    let mut store = Store::new(engine.inner(), TaskContext::new(task_id));

    let interrupt = interrupt.clone();
    store.epoch_deadline_callback(move |mut ctx| {
        if interrupt.is_requested() {
            return Err(Trap::Interrupt.into());
        }
        ctx.data_mut().deadline_checks += 1;
        Ok(UpdateDeadline::Continue(DEADLINE_TICKS))
    });
    store.set_epoch_deadline(DEADLINE_TICKS);

    store
}
