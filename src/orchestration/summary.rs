//! End-of-run summary.

use crate::core::task::{TaskId, TaskStatus};
use crate::orchestration::state::ExecutionState;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every task completed.
    Completed,
    /// The run finished but some tasks failed or were skipped.
    CompletedWithFailures,
    /// The run was aborted before it finished.
    Aborted,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::CompletedWithFailures => write!(f, "completed with failures"),
            RunOutcome::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// What a finished run did and how well it parallelised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub wall_time: Duration,
    /// Per-task outcome, sorted by id.
    pub tasks: Vec<TaskOutcome>,
    /// Attempts beyond the first, summed over all tasks.
    pub total_retries: u32,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Sum of all task estimates, in estimate units.
    pub sequential_estimate: f64,
    /// Sequential estimate in wall-clock terms divided by the actual wall
    /// time. Above 1.0 means the run beat one-at-a-time execution.
    pub parallel_efficiency: f64,
}

impl RunSummary {
    /// Summarise a finished run.
    ///
    /// `time_unit` is the wall-clock length of one estimate unit.
    pub fn from_state(
        state: &ExecutionState,
        sequential_estimate: f64,
        time_unit: Duration,
        wall_time: Duration,
    ) -> Self {
        let tasks: Vec<TaskOutcome> = state
            .tasks
            .iter()
            .map(|(id, record)| TaskOutcome {
                task_id: id.clone(),
                status: record.status,
                attempts: record.attempts,
                last_error: record.last_error.clone(),
            })
            .collect();

        let completed = state.count(TaskStatus::Completed);
        let outcome = if state.aborted {
            RunOutcome::Aborted
        } else if completed == tasks.len() {
            RunOutcome::Completed
        } else {
            RunOutcome::CompletedWithFailures
        };

        let wall_secs = wall_time.as_secs_f64();
        let parallel_efficiency = if wall_secs > 0.0 {
            sequential_estimate * time_unit.as_secs_f64() / wall_secs
        } else {
            0.0
        };

        Self {
            run_id: state.run_id,
            outcome,
            wall_time,
            total_retries: tasks.iter().map(|t| t.attempts.saturating_sub(1)).sum(),
            completed,
            failed: state.count(TaskStatus::Failed),
            skipped: state.count(TaskStatus::Skipped),
            tasks,
            sequential_estimate,
            parallel_efficiency,
        }
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&TaskOutcome> {
        self.tasks.iter().find(|t| &t.task_id == task_id)
    }

    pub fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.task(task_id).map(|t| t.status)
    }
}
