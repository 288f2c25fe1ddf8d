//! Task data model for the dependency graph.
//!
//! Tasks are opaque units of work: the orchestrator only knows their id,
//! dependencies, estimated cost and resource demand. Task definitions can be
//! materialised from a TOML or JSON task file.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::{Error, Result};

/// Named scalar resource demands or capacities (e.g. `cpu`, `memory`).
///
/// A `BTreeMap` keeps iteration order stable, which keeps plans reproducible.
pub type Resources = BTreeMap<String, f64>;

/// Unique identifier for a task within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a task identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Task status in its lifecycle.
///
/// `Completed`, `Failed` and `Skipped` are terminal: no transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dispatch (initial state, and the state a retried task returns to).
    #[default]
    Pending,
    /// Dispatched to a worker.
    Running,
    /// Worker reported success.
    Completed,
    /// Retry budget exhausted, or the task could never be scheduled.
    Failed,
    /// Never ran because a dependency failed or the run was aborted.
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether the state machine permits moving from `self` to `to`.
    pub fn can_transition(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Pending)
                | (Running, Skipped)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

fn default_duration() -> f64 {
    1.0
}

/// A single declared task.
///
/// Immutable once the dependency graph for a run has been built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: TaskId,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Ids of the tasks that must reach a terminal state first.
    #[serde(default, alias = "depends_on")]
    pub dependencies: Vec<TaskId>,
    /// Estimated duration in abstract units (minutes by default).
    #[serde(default = "default_duration", alias = "duration")]
    pub estimated_duration: f64,
    /// Resource demand while the task runs.
    #[serde(default)]
    pub resources: Resources,
    /// Co-location hint.
    #[serde(default)]
    pub group: Option<String>,
    /// Whether re-running after an explicit task error is safe.
    #[serde(default)]
    pub idempotent: bool,
    /// Per-task override of the run-wide retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl Task {
    /// Create a task with no dependencies, unit duration and no resource demand.
    pub fn new(id: impl Into<String>, name: &str) -> Self {
        Self {
            id: TaskId::new(id),
            name: name.to_string(),
            dependencies: Vec::new(),
            estimated_duration: default_duration(),
            resources: Resources::new(),
            group: None,
            idempotent: false,
            max_retries: None,
        }
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies
            .into_iter()
            .map(TaskId::new)
            .collect();
        self
    }

    pub fn with_duration(mut self, estimated_duration: f64) -> Self {
        self.estimated_duration = estimated_duration;
        self
    }

    pub fn with_resource(mut self, resource: &str, amount: f64) -> Self {
        self.resources.insert(resource.to_string(), amount);
        self
    }

    pub fn in_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Display label: the name if one was given, otherwise the id.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            self.id.as_str()
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(default, rename = "task")]
    tasks: Vec<Task>,
}

/// Load task definitions from a file.
///
/// `.json` files hold an array of tasks; anything else is parsed as TOML with
/// one `[[task]]` table per task.
pub fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    let content = fs::read_to_string(path)?;
    parse_tasks(&content, path.extension().and_then(|ext| ext.to_str()))
}

fn parse_tasks(content: &str, extension: Option<&str>) -> Result<Vec<Task>> {
    match extension {
        Some(ext) if ext.eq_ignore_ascii_case("json") => Ok(serde_json::from_str(content)?),
        _ => {
            let file: TaskFile = toml::from_str(content)?;
            Ok(file.tasks)
        }
    }
}

/// Reject negative, infinite and NaN duration estimates.
pub(crate) fn validate_duration(task: &Task) -> Result<()> {
    if task.estimated_duration.is_finite() && task.estimated_duration >= 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidDuration {
            task_id: task.id.clone(),
            duration: task.estimated_duration,
        })
    }
}
