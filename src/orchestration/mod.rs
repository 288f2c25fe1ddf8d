//! Orchestration layer for Strata.
//!
//! This module turns a validated dependency graph into a resource-aware
//! execution plan and drives that plan across a bounded pool of workers,
//! retrying or cascading failures as configured.

mod coordinator;
mod planner;
mod pool;
mod recovery;
mod simulated;
mod state;
mod summary;
mod worker;

pub use coordinator::{
    Coordinator, Orchestrator, RunConfig, RunHandle, DEFAULT_CANCEL_GRACE_MS,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_TASK_TIMEOUT_SECS, DEFAULT_TIME_UNIT_MS,
};
pub use planner::{
    plan_layer, plan_run, Batch, ExecutionPlan, LayerPlan, PlanEstimates, PlannedRun,
    RejectedTask, ResourceProfile, DEFAULT_MAX_WORKERS, MAX_WORKERS,
};
pub use pool::{SlotAssignment, WorkerPool};
pub use recovery::{
    CascadePolicy, FailureKind, FailureRecord, FailureSignal, RecoveryDecision, RecoveryManager,
    RetryPolicy, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_DELAY_MS, DEFAULT_MAX_RETRIES,
};
pub use simulated::{Behavior, Script, SimulatedWorker, SimulatedWorkerFactory};
pub use state::{
    ExecutionState, StateEvent, StateHandle, StateTracker, TaskRecord, WorkerRecord,
};
pub use summary::{RunOutcome, RunSummary, TaskOutcome};
pub use worker::{
    Completion, CompletionNotifier, Worker, WorkerFactory, WorkerOutcome, WorkerStatus,
    COMPLETION_CHANNEL_CAPACITY,
};
