use thiserror::Error;

use crate::core::task::{TaskId, TaskStatus};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Invalid task id: {0:?}")]
    InvalidTaskId(String),

    #[error("Task {task_id} has invalid estimated duration {duration}")]
    InvalidDuration { task_id: TaskId, duration: f64 },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Task {task_id} depends on unknown task {dependency}")]
    UnknownDependency { task_id: TaskId, dependency: TaskId },

    #[error("Cyclic dependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<TaskId> },

    #[error("Layering deadlock: {} task(s) can never become ready", .remaining.len())]
    LayeringDeadlock { remaining: Vec<TaskId> },

    #[error(
        "Task {task_id} demands {demand} {resource} but a worker only provides {capacity}"
    )]
    UnschedulableResourceDemand {
        task_id: TaskId,
        resource: String,
        demand: f64,
        capacity: f64,
    },

    #[error("Invalid resource profile: {0}")]
    InvalidProfile(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid transition for task {task_id} from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn format_cycle(cycle: &[TaskId]) -> String {
    let mut path: Vec<&str> = cycle.iter().map(TaskId::as_str).collect();
    if let Some(first) = path.first().copied() {
        path.push(first);
    }
    path.join(" -> ")
}
