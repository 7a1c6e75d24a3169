//! Registry of live tasks.
//!
//! The single source of truth for which task identifiers are in use. Backed
//! by a [`DashMap`] so every lifecycle call can run concurrently.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use wasm_driver_common::DriverError;

use crate::task::{Task, TaskState};

/// Concurrency-safe mapping from task identifier to [`Task`].
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, Arc<Task>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task under its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::DuplicateTask`] if the identifier is taken.
    pub fn register(&self, task: Arc<Task>) -> Result<(), DriverError> {
        match self.tasks.entry(task.id().to_string()) {
            Entry::Occupied(_) => Err(DriverError::duplicate_task(task.id())),
            Entry::Vacant(entry) => {
                debug!(task_id = %task.id(), "Task registered");
                entry.insert(task);
                Ok(())
            }
        }
    }

    /// Look up a task.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotFound`] for an unknown identifier.
    pub fn lookup(&self, task_id: &str) -> Result<Arc<Task>, DriverError> {
        self.get(task_id)
            .ok_or_else(|| DriverError::not_found(task_id))
    }

    /// Look up a task, returning `None` for an unknown identifier.
    pub fn get(&self, task_id: &str) -> Option<Arc<Task>> {
        self.tasks.get(task_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a task.
    ///
    /// A task that has not exited can only be removed after a stop was
    /// requested for it.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotFound`] for an unknown identifier and
    /// [`DriverError::TaskRunning`] for a task that is still live.
    pub fn remove(&self, task_id: &str) -> Result<Arc<Task>, DriverError> {
        match self.tasks.entry(task_id.to_string()) {
            Entry::Vacant(_) => Err(DriverError::not_found(task_id)),
            Entry::Occupied(entry) => {
                let task = entry.get();
                if task.state() != TaskState::Exited && !task.stop_requested() {
                    return Err(DriverError::task_running(task_id));
                }
                debug!(task_id, "Task removed");
                Ok(entry.remove())
            }
        }
    }

    /// Drop the registration of `task` regardless of its state.
    ///
    /// Only removes the entry if it still refers to this very task.
    pub fn discard(&self, task: &Arc<Task>) -> bool {
        self.tasks
            .remove_if(task.id(), |_, registered| Arc::ptr_eq(registered, task))
            .is_some()
    }

    /// Snapshot of every registered task.
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.tasks
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` if no task is registered.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
