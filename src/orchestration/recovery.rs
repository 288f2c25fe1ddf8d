//! Failure classification and recovery decisions.
//!
//! The `RecoveryManager` turns every observed failure into an append-only
//! [`FailureRecord`] and decides what happens next: retry the task after an
//! exponential backoff, or fail it permanently and (under
//! [`CascadePolicy::FailFast`]) skip everything downstream of it.
//!
//! Failures are plain values. Nothing here returns `Err` for a task that
//! misbehaved; errors are reserved for broken invariants.

use crate::core::dag::DependencyGraph;
use crate::core::task::{Task, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default maximum number of retries before giving up on a task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;

/// Default ceiling for the exponential backoff.
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

/// Classification tag carried by every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The worker did not report before the task deadline.
    Timeout,
    /// The worker failed its health check while running the task.
    WorkerCrash,
    /// The worker reported an explicit failure.
    TaskError,
    /// The task was skipped because something upstream failed.
    DependencySkipCascade,
    /// The run was aborted and the worker did not stop within the grace period.
    Cancelled,
}

/// What the coordinator observed when a task stopped making progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSignal {
    /// No report arrived by the deadline.
    DeadlineExceeded,
    /// `status()` reported the worker unhealthy mid-task.
    HealthCheckFailed,
    /// The worker finished and reported a failure.
    ExplicitFailure,
}

impl FailureKind {
    pub fn classify(signal: FailureSignal) -> Self {
        match signal {
            FailureSignal::DeadlineExceeded => FailureKind::Timeout,
            FailureSignal::HealthCheckFailed => FailureKind::WorkerCrash,
            FailureSignal::ExplicitFailure => FailureKind::TaskError,
        }
    }

    /// Whether a failure of this kind may be retried for the given task.
    ///
    /// Explicit task errors are only retried when the task is idempotent.
    pub fn is_retryable(self, task: &Task) -> bool {
        match self {
            FailureKind::Timeout | FailureKind::WorkerCrash => true,
            FailureKind::TaskError => task.idempotent,
            FailureKind::DependencySkipCascade | FailureKind::Cancelled => false,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::WorkerCrash => write!(f, "worker crash"),
            FailureKind::TaskError => write!(f, "task error"),
            FailureKind::DependencySkipCascade => write!(f, "dependency skip cascade"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One observed failure. Appended to the log, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub task_id: TaskId,
    pub kind: FailureKind,
    /// Attempt number the failure belongs to (0 for tasks that never ran).
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub detail: Option<String>,
}

impl FailureRecord {
    pub fn new(task_id: TaskId, kind: FailureKind, attempt: u32, detail: Option<String>) -> Self {
        Self {
            task_id,
            kind,
            attempt,
            at: Utc::now(),
            detail,
        }
    }
}

/// Retry budget and backoff curve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt. Tasks may override it.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Upper bound for any single backoff.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// Backoff before re-running a task whose `attempt`-th run just failed.
    ///
    /// `base × 2^(attempt−1)`, capped at `max_delay_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64 << exponent;
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Retry budget for a specific task.
    pub fn max_retries_for(&self, task: &Task) -> u32 {
        task.max_retries.unwrap_or(self.max_retries)
    }
}

/// What happens to dependents when a task fails permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadePolicy {
    /// Skip every transitive dependent immediately.
    #[default]
    FailFast,
    /// Keep running unaffected branches; blocked tasks are skipped when
    /// their layer is reached.
    BestEffort,
}

/// Outcome of [`RecoveryManager::handle_failure`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryDecision {
    /// Re-run the task once `delay` has elapsed.
    Retry {
        delay: Duration,
        /// Attempt number the retry will run as.
        next_attempt: u32,
    },
    /// The task has failed for good. `skip` lists the dependents to skip now.
    Fail { skip: Vec<TaskId> },
}

/// Classifies failures, keeps the failure log and decides on recovery.
#[derive(Debug, Clone, Default)]
pub struct RecoveryManager {
    policy: RetryPolicy,
    cascade: CascadePolicy,
    failures: Vec<FailureRecord>,
}

impl RecoveryManager {
    pub fn new(policy: RetryPolicy, cascade: CascadePolicy) -> Self {
        Self {
            policy,
            cascade,
            failures: Vec::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn cascade(&self) -> CascadePolicy {
        self.cascade
    }

    /// Record a failure of `task`'s `attempt`-th run and decide what to do.
    ///
    /// Retries while `attempt < max_retries + 1` and the kind is retryable.
    /// Otherwise the task fails; under fail-fast the decision carries every
    /// transitive dependent, whether or not it is already terminal.
    pub fn handle_failure(
        &mut self,
        graph: &DependencyGraph,
        task: &Task,
        kind: FailureKind,
        attempt: u32,
        detail: Option<String>,
    ) -> (FailureRecord, RecoveryDecision) {
        let record = FailureRecord::new(task.id.clone(), kind, attempt, detail);
        self.failures.push(record.clone());

        let budget = self.policy.max_retries_for(task).saturating_add(1);
        if kind.is_retryable(task) && attempt < budget {
            let decision = RecoveryDecision::Retry {
                delay: self.policy.backoff(attempt),
                next_attempt: attempt + 1,
            };
            return (record, decision);
        }

        (record, self.permanent_failure(graph, &task.id))
    }

    /// Decision for a task that fails without a retry (e.g. it could never
    /// be scheduled).
    pub fn permanent_failure(&self, graph: &DependencyGraph, task_id: &TaskId) -> RecoveryDecision {
        let skip = match self.cascade {
            CascadePolicy::FailFast => graph.transitive_dependents(task_id).into_iter().collect(),
            CascadePolicy::BestEffort => Vec::new(),
        };
        RecoveryDecision::Fail { skip }
    }

    /// Append a record without making a decision.
    pub fn record(&mut self, record: FailureRecord) -> FailureRecord {
        self.failures.push(record.clone());
        record
    }

    /// Record that `task_id` was skipped because `cause` did not complete.
    pub fn record_cascade(&mut self, task_id: &TaskId, cause: &TaskId) -> FailureRecord {
        self.record(FailureRecord::new(
            task_id.clone(),
            FailureKind::DependencySkipCascade,
            0,
            Some(format!("dependency {} did not complete", cause)),
        ))
    }

    /// The full failure log, in the order failures were observed.
    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }

    /// Failure records for one task.
    pub fn failures_for<'a>(&'a self, task_id: &'a TaskId) -> impl Iterator<Item = &'a FailureRecord> {
        self.failures.iter().filter(move |r| &r.task_id == task_id)
    }
}
