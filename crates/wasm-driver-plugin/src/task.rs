//! Task state machine.
//!
//! A [`Task`] moves through `Starting -> Running -> Exited` exactly once.
//! The exit result is published on a watch channel, which doubles as the
//! one-shot completion signal every waiter observes.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use wasm_driver_common::{DriverError, TaskConfig, TaskDescriptor};
use wasm_driver_core::{CachedModule, EngineBackend, ExitResult, InterruptHandle, execute};

use crate::events::{EventBus, TaskEvent};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Created, module not yet running.
    Starting,
    /// The call protocol is executing.
    Running,
    /// Terminal; the exit result is available.
    Exited,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Starting => write!(f, "starting"),
            TaskState::Running => write!(f, "running"),
            TaskState::Exited => write!(f, "exited"),
        }
    }
}

/// Point-in-time view of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatus {
    /// Task identifier.
    pub task_id: String,
    /// Current state.
    pub state: TaskState,
    /// When the task was created.
    pub started_at: SystemTime,
    /// Exit result, present once the state is [`TaskState::Exited`].
    pub exit_result: Option<ExitResult>,
}

/// One orchestrator-requested unit of work.
pub struct Task {
    descriptor: TaskDescriptor,
    state: RwLock<TaskState>,
    started_at: SystemTime,
    interrupt: InterruptHandle,
    completion: watch::Sender<Option<ExitResult>>,
    events: EventBus,
}

impl Task {
    /// Create a task in the `Starting` state.
    pub fn new(descriptor: TaskDescriptor, interrupt: InterruptHandle, events: EventBus) -> Self {
        let (completion, _) = watch::channel(None);
        Self {
            descriptor,
            state: RwLock::new(TaskState::Starting),
            started_at: SystemTime::now(),
            interrupt,
            completion,
            events,
        }
    }

    /// Task identifier.
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Task configuration.
    pub fn config(&self) -> &TaskConfig {
        &self.descriptor.config
    }

    /// When the task was created.
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        *self.state.read()
    }

    /// Returns `true` once a stop was requested.
    pub fn stop_requested(&self) -> bool {
        self.interrupt.is_requested()
    }

    /// Run the call protocol for `module` on a blocking thread.
    ///
    /// Moves the task to `Running`. Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a state error if the task was already started, or if it was
    /// stopped before it started running. A stopped task keeps its exit result.
    pub fn start(
        self: &Arc<Self>,
        backend: Arc<dyn EngineBackend>,
        module: CachedModule,
    ) -> Result<(), DriverError> {
        {
            let mut state = self.state.write();
            let current = *state;
            match current {
                TaskState::Starting => *state = TaskState::Running,
                TaskState::Exited => {
                    debug!(task_id = %self.id(), "Task exited before it started running");
                    return Err(DriverError::invalid_state(
                        self.id(),
                        "task exited before it started running",
                    ));
                }
                TaskState::Running => {
                    return Err(DriverError::invalid_state(
                        self.id(),
                        "task is already running",
                    ));
                }
            }
        }

        let task = Arc::clone(self);
        let runner = tokio::task::spawn_blocking(move || {
            execute(
                backend.as_ref(),
                task.id(),
                &module,
                task.config(),
                &task.interrupt,
            )
        });

        let task = Arc::clone(self);
        tokio::spawn(async move {
            let result = match runner.await {
                Ok(result) => result,
                Err(e) => {
                    error!(task_id = %task.id(), error = %e, "Task execution aborted");
                    ExitResult::failed(format!("task execution aborted: {e}"))
                }
            };
            task.finish(result);
        });

        info!(task_id = %self.id(), module = %self.config().module_path.display(), "Task running");

        Ok(())
    }

    /// Request the task to stop.
    ///
    /// A running call is interrupted at its next preemption checkpoint; a
    /// task that has not started running exits immediately.
    ///
    /// Returns `false` if the task had already exited.
    pub fn stop(&self) -> bool {
        let mut state = self.state.write();
        let current = *state;
        match current {
            TaskState::Exited => false,
            TaskState::Starting => {
                self.interrupt.interrupt();
                self.complete(&mut *state, ExitResult::stopped("task stopped before it started"));
                true
            }
            TaskState::Running => {
                drop(state);
                if self.interrupt.interrupt() {
                    info!(task_id = %self.id(), "Task stop requested");
                }
                true
            }
        }
    }

    /// Record the exit result.
    ///
    /// Only the first call has an effect; returns `false` for later calls.
    pub fn finish(&self, result: ExitResult) -> bool {
        let mut state = self.state.write();
        if *state == TaskState::Exited {
            warn!(task_id = %self.id(), cause = %result.cause, "Ignoring second task exit");
            return false;
        }
        self.complete(&mut *state, result);
        true
    }

    fn complete(&self, state: &mut TaskState, result: ExitResult) {
        *state = TaskState::Exited;

        info!(
            task_id = %self.id(),
            cause = %result.cause,
            exit_code = result.exit_code,
            "Task exited"
        );
        self.events.publish(TaskEvent::new(
            self.id(),
            format!("Task exited: {} (exit code {})", result.cause, result.exit_code),
        ));

        // Sent while the state lock is held, so no status snapshot can see
        // `Exited` without its result.
        self.completion.send_replace(Some(result));
    }

    /// Non-blocking snapshot of the task.
    pub fn status(&self) -> TaskStatus {
        let state = self.state.read();
        TaskStatus {
            task_id: self.id().to_string(),
            state: *state,
            started_at: self.started_at,
            exit_result: self.completion.borrow().clone(),
        }
    }

    /// Exit result, if the task has exited.
    pub fn exit_result(&self) -> Option<ExitResult> {
        self.completion.borrow().clone()
    }

    /// Wait until the task exits.
    ///
    /// Every waiter receives the same result. Dropping the future leaves the
    /// task untouched.
    pub async fn wait(&self) -> Result<ExitResult, DriverError> {
        let mut completion = self.completion.subscribe();
        let result = completion
            .wait_for(Option::is_some)
            .await
            .map_err(|_| DriverError::invalid_state(self.id(), "completion signal closed"))?;

        Option::clone(&result)
            .ok_or_else(|| DriverError::invalid_state(self.id(), "task exited without a result"))
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.descriptor.id)
            .field("state", &self.state())
            .field("stop_requested", &self.stop_requested())
            .finish_non_exhaustive()
    }
}
