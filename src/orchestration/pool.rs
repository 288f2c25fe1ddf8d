//! Worker pool for slot management.
//!
//! The `WorkerPool` owns one worker per slot, tracks which task attempt each
//! slot is running and when it must finish, and enforces the `max_workers`
//! concurrency bound: a slot runs at most one task at a time and there are
//! never more slots than `max_workers`.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::worker::{
    Completion, CompletionNotifier, Worker, WorkerFactory, WorkerOutcome, WorkerStatus,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Deadline used when a configured timeout overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// The task attempt currently occupying a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAssignment {
    pub task_id: TaskId,
    pub attempt: u32,
    pub dispatched_at: Instant,
    pub deadline: Instant,
    /// Set once `cancel()` has been sent; the slot is reclaimed when the
    /// worker returns to idle.
    pub cancel_requested_at: Option<Instant>,
}

impl SlotAssignment {
    pub fn is_cancelling(&self) -> bool {
        self.cancel_requested_at.is_some()
    }

    /// Whether this assignment is the one a completion report refers to.
    pub fn matches(&self, task_id: &TaskId, attempt: u32) -> bool {
        &self.task_id == task_id && self.attempt == attempt
    }
}

struct Slot {
    worker: Box<dyn Worker>,
    assignment: Option<SlotAssignment>,
    healthy: bool,
}

/// Manages a fixed set of worker slots.
pub struct WorkerPool {
    slots: Vec<Slot>,
    completion_tx: mpsc::Sender<Completion>,
}

impl WorkerPool {
    /// Create a pool with `max_workers` slots, one worker per slot.
    ///
    /// # Arguments
    ///
    /// * `max_workers` - Maximum number of tasks that can run simultaneously
    /// * `factory` - Builds the worker for each slot
    /// * `completion_tx` - Channel the workers report finished attempts on
    pub fn new(
        max_workers: usize,
        factory: &dyn WorkerFactory,
        completion_tx: mpsc::Sender<Completion>,
    ) -> Self {
        let slots = (0..max_workers)
            .map(|slot| Slot {
                worker: factory.create(slot),
                assignment: None,
                healthy: true,
            })
            .collect();
        Self {
            slots,
            completion_tx,
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots with a task assigned (including ones being cancelled).
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.assignment.is_some()).count()
    }

    pub fn healthy_count(&self) -> usize {
        self.slots.iter().filter(|s| s.healthy).count()
    }

    pub fn is_healthy(&self, slot: usize) -> bool {
        self.slots.get(slot).is_some_and(|s| s.healthy)
    }

    /// Healthy slots with no assignment, in slot order.
    pub fn idle_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.healthy && s.assignment.is_none())
            .map(|(index, _)| index)
            .collect()
    }

    /// Slots with an assignment, in slot order.
    pub fn busy_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.assignment.is_some())
            .map(|(index, _)| index)
            .collect()
    }

    pub fn assignment(&self, slot: usize) -> Option<&SlotAssignment> {
        self.slots.get(slot).and_then(|s| s.assignment.as_ref())
    }

    /// Ask the worker in `slot` for its status.
    pub fn worker_status(&self, slot: usize) -> WorkerStatus {
        match self.slots.get(slot) {
            Some(s) if s.healthy => s.worker.status(),
            _ => WorkerStatus::Unhealthy,
        }
    }

    /// Start `attempt` of `task` on an idle slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Worker`] if the slot is unknown, unhealthy or busy, or
    /// if the worker refuses the task. The slot stays unassigned on error.
    pub fn dispatch(
        &mut self,
        slot: usize,
        task: &Task,
        attempt: u32,
        timeout: Duration,
    ) -> Result<()> {
        let notifier = CompletionNotifier::new(slot, self.completion_tx.clone());
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| Error::Worker(format!("no slot {}", slot)))?;
        if !entry.healthy {
            return Err(Error::Worker(format!("slot {} is unhealthy", slot)));
        }
        if entry.assignment.is_some() {
            return Err(Error::Worker(format!("slot {} is busy", slot)));
        }

        entry.worker.start(task, attempt, notifier)?;

        let now = Instant::now();
        entry.assignment = Some(SlotAssignment {
            task_id: task.id.clone(),
            attempt,
            dispatched_at: now,
            deadline: now.checked_add(timeout).unwrap_or(now + FAR_FUTURE),
            cancel_requested_at: None,
        });
        Ok(())
    }

    /// Send `cancel()` for the slot's task and remember when it was sent.
    pub fn cancel(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            if let Some(assignment) = entry.assignment.as_mut() {
                if assignment.cancel_requested_at.is_none() {
                    entry.worker.cancel(&assignment.task_id);
                    assignment.cancel_requested_at = Some(Instant::now());
                }
            }
        }
    }

    /// Take the outcome of the slot's finished task from its worker.
    pub fn take_result(&mut self, slot: usize, task_id: &TaskId) -> Option<WorkerOutcome> {
        self.slots
            .get_mut(slot)
            .and_then(|entry| entry.worker.result(task_id))
    }

    /// Free the slot, returning what it was running.
    pub fn release(&mut self, slot: usize) -> Option<SlotAssignment> {
        self.slots
            .get_mut(slot)
            .and_then(|entry| entry.assignment.take())
    }

    /// Take the slot out of service for the rest of the run.
    pub fn mark_unhealthy(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            entry.healthy = false;
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size())
            .field("active", &self.active_count())
            .field("healthy", &self.healthy_count())
            .finish()
    }
}
