//! Task event broadcast.
//!
//! Every lifecycle transition worth surfacing to the orchestrator is
//! published on one [`EventBus`]. Subscribers that fall behind lose the
//! oldest events rather than slowing tasks down.

use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Number of events buffered per subscriber.
pub const EVENT_CAPACITY: usize = 64;

/// A lifecycle event of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskEvent {
    /// Task the event belongs to.
    pub task_id: String,
    /// Human-readable description.
    pub message: String,
    /// When the event was published.
    pub timestamp: SystemTime,
}

impl TaskEvent {
    /// Create an event stamped with the current time.
    pub fn new(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            message: message.into(),
            timestamp: SystemTime::now(),
        }
    }
}

/// Broadcast channel of [`TaskEvent`]s.
///
/// Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    /// Create an event bus.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Publish an event to every current subscriber.
    pub fn publish(&self, event: TaskEvent) {
        // No subscribers is not an error.
        if self.sender.send(event).is_err() {
            trace!("Task event dropped without subscribers");
        }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
