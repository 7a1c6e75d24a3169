//! Types reported to the orchestrator.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use wasm_driver_common::TaskConfig;

/// Name the driver registers under.
pub const PLUGIN_NAME: &str = "wasm-task-driver";

/// Plugin API versions the driver speaks.
pub const PLUGIN_API_VERSIONS: &[&str] = &["0.1.0"];

/// Version of the [`TaskHandle`] layout.
pub const TASK_HANDLE_VERSION: u32 = 1;

/// Plugin identification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    /// Plugin name.
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// Supported plugin API versions.
    pub api_versions: Vec<String>,
}

impl Default for PluginInfo {
    fn default() -> Self {
        Self {
            name: PLUGIN_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            api_versions: PLUGIN_API_VERSIONS.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Optional features the driver supports. Neither is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Capabilities {
    /// Whether signals can be delivered to tasks.
    pub send_signals: bool,
    /// Whether commands can be executed inside tasks.
    pub exec: bool,
}

/// Health of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Able to run tasks.
    Healthy,
    /// Not able to run tasks.
    Unhealthy,
}

/// One fingerprint sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fingerprint {
    /// Driver health.
    pub health: HealthState,
    /// Human-readable health description.
    pub description: String,
    /// Node attributes advertised by the driver.
    pub attributes: BTreeMap<String, String>,
}

/// One resource usage sample of a task.
///
/// The driver does not account guest resources, so every field is empty.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct TaskResourceUsage {
    /// Memory usage, if measured.
    pub memory: Option<MemoryUsage>,
    /// CPU usage, if measured.
    pub cpu: Option<CpuUsage>,
    /// When the sample was taken.
    pub timestamp: Option<SystemTime>,
}

impl TaskResourceUsage {
    /// An empty sample stamped with the current time.
    pub fn empty() -> Self {
        Self {
            timestamp: Some(SystemTime::now()),
            ..Self::default()
        }
    }
}

/// Memory usage figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MemoryUsage {
    /// Resident bytes.
    pub rss: u64,
}

/// CPU usage figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CpuUsage {
    /// Total CPU time in nanoseconds.
    pub total_ticks: u64,
}

/// Handle returned to the orchestrator when a task starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    /// Layout version.
    pub version: u32,
    /// Task identifier.
    pub task_id: String,
    /// When the task was created.
    pub started_at: SystemTime,
    /// Task configuration.
    pub config: TaskConfig,
}
