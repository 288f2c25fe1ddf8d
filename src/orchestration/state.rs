//! Execution state tracking.
//!
//! The [`StateTracker`] is the single writer of a run's [`ExecutionState`].
//! Every task transition is validated against the lifecycle state machine,
//! applied under the write lock, and then published as a [`StateEvent`] to
//! every subscriber. Observers read consistent snapshots through a cloneable
//! [`StateHandle`], both during the run and after it has finished.

use crate::core::task::{TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::recovery::FailureRecord;
use crate::orchestration::worker::WorkerStatus;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// Per-task execution record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub status: TaskStatus,
    /// Number of times the task has been dispatched.
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Slot of the current or most recent run.
    pub worker: Option<usize>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-slot worker record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub slot: usize,
    pub status: WorkerStatus,
    pub current_task: Option<TaskId>,
}

/// Everything known about a run at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub run_id: Uuid,
    /// Index of the layer currently being dispatched.
    pub current_layer: usize,
    pub tasks: BTreeMap<TaskId, TaskRecord>,
    pub workers: Vec<WorkerRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub aborted: bool,
    /// Append-only failure log.
    pub failures: Vec<FailureRecord>,
}

impl ExecutionState {
    pub fn new<I>(run_id: Uuid, task_ids: I, workers: usize) -> Self
    where
        I: IntoIterator<Item = TaskId>,
    {
        Self {
            run_id,
            current_layer: 0,
            tasks: task_ids
                .into_iter()
                .map(|id| (id, TaskRecord::default()))
                .collect(),
            workers: (0..workers)
                .map(|slot| WorkerRecord {
                    slot,
                    ..Default::default()
                })
                .collect(),
            started_at: Utc::now(),
            finished_at: None,
            aborted: false,
            failures: Vec::new(),
        }
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(id).map(|record| record.status)
    }

    pub fn record(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.tasks.get(id)
    }

    /// Ids of all tasks currently in `status`.
    pub fn with_status(&self, status: TaskStatus) -> BTreeSet<TaskId> {
        self.tasks
            .iter()
            .filter(|(_, record)| record.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn completed(&self) -> BTreeSet<TaskId> {
        self.with_status(TaskStatus::Completed)
    }

    pub fn failed(&self) -> BTreeSet<TaskId> {
        self.with_status(TaskStatus::Failed)
    }

    pub fn running(&self) -> BTreeSet<TaskId> {
        self.with_status(TaskStatus::Running)
    }

    pub fn skipped(&self) -> BTreeSet<TaskId> {
        self.with_status(TaskStatus::Skipped)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|r| r.status == status).count()
    }

    /// True once every task has reached a terminal status.
    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|r| r.status.is_terminal())
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn failures_for<'a>(
        &'a self,
        task_id: &'a TaskId,
    ) -> impl Iterator<Item = &'a FailureRecord> {
        self.failures.iter().filter(move |r| &r.task_id == task_id)
    }
}

/// A published task transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
    /// Attempt count after the transition.
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

impl std::fmt::Display for StateEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} -> {} (attempt {})",
            self.task_id, self.from, self.to, self.attempt
        )
    }
}

/// Read-only view of a run's state, shareable across threads.
#[derive(Debug, Clone)]
pub struct StateHandle {
    state: Arc<RwLock<ExecutionState>>,
}

impl StateHandle {
    fn read(&self) -> RwLockReadGuard<'_, ExecutionState> {
        // A poisoned lock still holds the last consistent state: every write
        // is validated before it is applied.
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A consistent copy of the whole state.
    pub fn snapshot(&self) -> ExecutionState {
        self.read().clone()
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.read().status(id)
    }

    /// Run a closure against the current state without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&ExecutionState) -> R) -> R {
        f(&self.read())
    }
}

/// Single writer of a run's [`ExecutionState`].
pub struct StateTracker {
    state: Arc<RwLock<ExecutionState>>,
    subscribers: Vec<Sender<StateEvent>>,
}

impl StateTracker {
    pub fn new(state: ExecutionState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
            subscribers: Vec::new(),
        }
    }

    pub fn handle(&self) -> StateHandle {
        StateHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Subscribe to every transition published from now on.
    pub fn subscribe(&mut self) -> Receiver<StateEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    fn write(&self) -> RwLockWriteGuard<'_, ExecutionState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> RwLockReadGuard<'_, ExecutionState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.read().status(id)
    }

    pub fn attempts(&self, id: &TaskId) -> u32 {
        self.read().record(id).map(|r| r.attempts).unwrap_or(0)
    }

    pub fn snapshot(&self) -> ExecutionState {
        self.read().clone()
    }

    /// Move a task to `to`.
    ///
    /// `pending -> running` increments the attempt count and records the
    /// slot. `error` becomes the task's last error when given.
    ///
    /// # Errors
    /// [`Error::TaskNotFound`] for an unknown id, [`Error::InvalidTransition`]
    /// when the lifecycle does not allow the move. The state is unchanged
    /// on error.
    pub fn transition(
        &mut self,
        id: &TaskId,
        to: TaskStatus,
        slot: Option<usize>,
        error: Option<String>,
    ) -> Result<StateEvent> {
        let event = {
            let mut state = self.write();
            let record = state
                .tasks
                .get_mut(id)
                .ok_or_else(|| Error::TaskNotFound(id.clone()))?;

            let from = record.status;
            if !from.can_transition(to) {
                return Err(Error::InvalidTransition {
                    task_id: id.clone(),
                    from,
                    to,
                });
            }

            let now = Utc::now();
            record.status = to;
            if to == TaskStatus::Running {
                record.attempts += 1;
                record.worker = slot;
                record.started_at = Some(now);
                record.finished_at = None;
            }
            if to.is_terminal() {
                record.finished_at = Some(now);
            }
            if error.is_some() {
                record.last_error = error;
            }

            StateEvent {
                task_id: id.clone(),
                from,
                to,
                attempt: record.attempts,
                at: now,
            }
        };

        self.publish(&event);
        Ok(event)
    }

    fn publish(&mut self, event: &StateEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn set_worker(&self, slot: usize, status: WorkerStatus, current_task: Option<TaskId>) {
        let mut state = self.write();
        if let Some(worker) = state.workers.get_mut(slot) {
            worker.status = status;
            worker.current_task = current_task;
        }
    }

    pub fn set_layer(&self, layer: usize) {
        self.write().current_layer = layer;
    }

    pub fn record_failure(&self, record: FailureRecord) {
        self.write().failures.push(record);
    }

    pub fn mark_aborted(&self) {
        self.write().aborted = true;
    }

    /// Stamp the end of the run. The state stays readable afterwards.
    pub fn finish(&self) {
        let mut state = self.write();
        if state.finished_at.is_none() {
            state.finished_at = Some(Utc::now());
        }
    }
}
