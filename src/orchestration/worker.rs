//! Worker capability trait.
//!
//! A worker is an isolated execution context the coordinator can start,
//! cancel, poll and read results from. It never sees the graph or other
//! tasks. When a run finishes (successfully or not) the worker pushes a
//! [`Completion`] through its [`CompletionNotifier`]; the coordinator then
//! reads the outcome with [`Worker::result`].

use crate::core::task::{Task, TaskId};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Capacity of the completion channel shared by all workers of a run.
pub const COMPLETION_CHANNEL_CAPACITY: usize = 100;

/// Health and activity of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Busy,
    Unhealthy,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Final outcome of one task run on a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerOutcome {
    Success,
    /// Explicit failure with diagnostic detail.
    Failure(String),
}

/// A worker's report that an attempt has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub slot: usize,
    pub task_id: TaskId,
    pub attempt: u32,
}

/// Sending half of the completion channel, bound to one worker slot.
#[derive(Debug, Clone)]
pub struct CompletionNotifier {
    slot: usize,
    tx: mpsc::Sender<Completion>,
}

impl CompletionNotifier {
    pub fn new(slot: usize, tx: mpsc::Sender<Completion>) -> Self {
        Self { slot, tx }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Report that `attempt` of `task_id` has finished.
    ///
    /// A closed channel means the run is over; the report is dropped.
    pub async fn notify(&self, task_id: TaskId, attempt: u32) {
        let _ = self
            .tx
            .send(Completion {
                slot: self.slot,
                task_id,
                attempt,
            })
            .await;
    }
}

/// The fixed capability set every worker exposes.
pub trait Worker: Send {
    /// Begin running `task`. Must return promptly; the work proceeds in the
    /// background and finishes with a call to `notifier.notify`.
    fn start(&mut self, task: &Task, attempt: u32, notifier: CompletionNotifier) -> Result<()>;

    /// Ask the worker to stop running `task_id`. A well-behaved worker
    /// returns to [`WorkerStatus::Idle`] shortly after.
    fn cancel(&mut self, task_id: &TaskId);

    fn status(&self) -> WorkerStatus;

    /// Take the outcome of the last finished run of `task_id`, if any.
    fn result(&mut self, task_id: &TaskId) -> Option<WorkerOutcome>;
}

/// Builds one worker per pool slot.
pub trait WorkerFactory: Send + Sync {
    fn create(&self, slot: usize) -> Box<dyn Worker>;
}
