//! Worker coordination for a planned run.
//!
//! The `Coordinator` is the run's single control loop. It owns the worker
//! pool, the state tracker and the recovery manager, and walks the plan
//! layer by layer:
//!
//! 1. Drain worker completion reports.
//! 2. Health-check busy slots and enforce task deadlines.
//! 3. Release retries whose backoff has elapsed into their batch backlog.
//! 4. Advance to the next layer once every task in the current one is
//!    terminal.
//! 5. Hand work to idle slots: each slot runs its own planned tasks in
//!    order, and a slot with nothing planned takes work from the backlog of
//!    the oldest unfinished batch.
//! 6. Sleep until a completion arrives, the poll interval passes or the run
//!    is aborted.
//!
//! [`Orchestrator`] is the entry point: it plans task sets and starts runs,
//! returning a [`RunHandle`] for observing and aborting them.

use crate::core::dag::DependencyGraph;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::planner::{plan_run, ExecutionPlan, PlannedRun, ResourceProfile};
use crate::orchestration::pool::WorkerPool;
use crate::orchestration::recovery::{
    CascadePolicy, FailureKind, FailureRecord, FailureSignal, RecoveryDecision, RecoveryManager,
    RetryPolicy,
};
use crate::orchestration::state::{ExecutionState, StateEvent, StateHandle, StateTracker};
use crate::orchestration::summary::RunSummary;
use crate::orchestration::worker::{
    Completion, WorkerFactory, WorkerOutcome, WorkerStatus, COMPLETION_CHANNEL_CAPACITY,
};
use crossbeam_channel::Receiver;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default time a task may run before it is cancelled as timed out.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 3600;

/// Default time a worker gets to return to idle after `cancel()`.
pub const DEFAULT_CANCEL_GRACE_MS: u64 = 5000;

/// Default control-loop tick.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Default wall-clock length of one estimate unit (a minute).
pub const DEFAULT_TIME_UNIT_MS: u64 = 60_000;

/// Runtime settings for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub profile: ResourceProfile,
    pub retry: RetryPolicy,
    pub cascade: CascadePolicy,
    /// Plan around tasks whose demand no slot can meet instead of refusing
    /// the whole run. Such tasks fail at run start.
    pub allow_partial_plans: bool,
    pub task_timeout: Duration,
    pub cancel_grace: Duration,
    pub poll_interval: Duration,
    /// Wall-clock length of one estimate unit.
    pub time_unit: Duration,
    /// Hold later batches while a retry on the critical path waits.
    pub prioritize_critical_path: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            profile: ResourceProfile::default(),
            retry: RetryPolicy::default(),
            cascade: CascadePolicy::default(),
            allow_partial_plans: false,
            task_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
            cancel_grace: Duration::from_millis(DEFAULT_CANCEL_GRACE_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            time_unit: Duration::from_millis(DEFAULT_TIME_UNIT_MS),
            prioritize_critical_path: false,
        }
    }
}

/// A failed task waiting out its backoff.
#[derive(Debug, Clone)]
struct PendingRetry {
    task_id: TaskId,
    ready_at: Instant,
    batch: usize,
}

/// The control loop of one run.
pub struct Coordinator {
    graph: Arc<DependencyGraph>,
    plan: Arc<ExecutionPlan>,
    config: RunConfig,
    pool: WorkerPool,
    tracker: StateTracker,
    recovery: RecoveryManager,
    completion_rx: mpsc::Receiver<Completion>,
    cancel: CancellationToken,
    /// Index of the layer being dispatched.
    layer: usize,
    /// Per slot, the planned tasks of the current layer not yet started.
    slot_queues: Vec<VecDeque<TaskId>>,
    /// Per batch of the current layer, work any idle slot may take.
    backlogs: Vec<VecDeque<TaskId>>,
    /// Batch index of every task in the current layer.
    batch_of: HashMap<TaskId, usize>,
    retries: Vec<PendingRetry>,
    /// Critical-path retries not yet dispatched.
    critical_retries: HashSet<TaskId>,
}

impl Coordinator {
    /// Create a coordinator with one worker per planned slot.
    pub fn new(
        graph: Arc<DependencyGraph>,
        plan: Arc<ExecutionPlan>,
        config: RunConfig,
        factory: &dyn WorkerFactory,
        tracker: StateTracker,
        cancel: CancellationToken,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::channel(COMPLETION_CHANNEL_CAPACITY);
        let pool = WorkerPool::new(plan.profile.max_workers, factory, completion_tx);
        let recovery = RecoveryManager::new(config.retry.clone(), config.cascade);

        Self {
            graph,
            plan,
            config,
            pool,
            tracker,
            recovery,
            completion_rx,
            cancel,
            layer: 0,
            slot_queues: Vec::new(),
            backlogs: Vec::new(),
            batch_of: HashMap::new(),
            retries: Vec::new(),
            critical_retries: HashSet::new(),
        }
    }

    /// Drive the run to completion (or abort) and summarise it.
    ///
    /// # Errors
    /// Only on broken internal invariants (an illegal state transition or an
    /// unknown task). Task and worker failures are recorded, not returned.
    pub async fn run(mut self) -> Result<RunSummary> {
        let started = Instant::now();
        let cancel = self.cancel.clone();
        let poll = self.config.poll_interval;
        let run_id = self.tracker.snapshot().run_id;

        info!(
            %run_id,
            tasks = self.graph.task_count(),
            layers = self.graph.layers().len(),
            workers = self.pool.size(),
            "run started"
        );

        self.fail_rejected()?;
        self.enter_layer()?;

        loop {
            if cancel.is_cancelled() {
                self.abort().await?;
                break;
            }

            self.drain_completions()?;
            self.check_health()?;
            self.check_timeouts()?;
            self.promote_retries();
            if self.pool.healthy_count() == 0 {
                self.fail_without_workers()?;
            }
            if self.advance_layers()? {
                break;
            }
            self.dispatch()?;

            let received = tokio::select! {
                received = self.completion_rx.recv() => received,
                _ = tokio::time::sleep(poll) => None,
                _ = cancel.cancelled() => None,
            };
            if let Some(completion) = received {
                self.handle_completion(completion)?;
            }
        }

        self.tracker.finish();
        let summary = RunSummary::from_state(
            &self.tracker.snapshot(),
            self.plan.estimates.sequential_duration,
            self.config.time_unit,
            started.elapsed(),
        );
        info!(
            %run_id,
            outcome = %summary.outcome,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            retries = summary.total_retries,
            wall_ms = summary.wall_time.as_millis() as u64,
            "run finished"
        );
        Ok(summary)
    }

    fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.tracker.status(id)
    }

    fn is_terminal(&self, id: &TaskId) -> bool {
        self.status(id).is_some_and(TaskStatus::is_terminal)
    }

    // ========== Layers ==========

    /// Set up dispatch queues for the current layer.
    ///
    /// Tasks whose dependencies did not all complete are skipped here; under
    /// fail-fast they were normally skipped already when the failure happened.
    fn enter_layer(&mut self) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let plan = Arc::clone(&self.plan);
        let Some(ids) = graph.layers().get(self.layer) else {
            return Ok(());
        };
        self.tracker.set_layer(self.layer);

        for id in ids {
            if self.status(id) != Some(TaskStatus::Pending) {
                continue;
            }
            let blocker = graph
                .dependencies(id)
                .iter()
                .find(|dep| self.status(dep) != Some(TaskStatus::Completed));
            if let Some(cause) = blocker {
                self.skip_task(id, cause)?;
            }
        }

        self.slot_queues = vec![VecDeque::new(); self.pool.size()];
        self.backlogs.clear();
        self.batch_of.clear();

        let batches = plan.layer(self.layer).map(|l| l.batches.len()).unwrap_or(0);
        if let Some(layer_plan) = plan.layer(self.layer) {
            self.backlogs = vec![VecDeque::new(); layer_plan.batches.len()];
            for batch in &layer_plan.batches {
                for id in &batch.tasks {
                    self.batch_of.insert(id.clone(), batch.index);
                    if self.status(id) != Some(TaskStatus::Pending) {
                        continue;
                    }
                    match layer_plan.assignments.get(id) {
                        Some(&slot) if slot < self.slot_queues.len() => {
                            self.slot_queues[slot].push_back(id.clone())
                        }
                        _ => self.backlogs[batch.index].push_back(id.clone()),
                    }
                }
            }
        }

        info!(layer = self.layer, tasks = ids.len(), batches, "entering layer");
        Ok(())
    }

    /// Move past every finished layer. Returns `true` when no layers remain.
    fn advance_layers(&mut self) -> Result<bool> {
        loop {
            let graph = Arc::clone(&self.graph);
            let Some(ids) = graph.layers().get(self.layer) else {
                return Ok(true);
            };
            if !ids.iter().all(|id| self.is_terminal(id)) {
                return Ok(false);
            }
            debug!(layer = self.layer, "layer complete");
            self.layer += 1;
            self.enter_layer()?;
        }
    }

    /// First batch of the current layer with a non-terminal task.
    fn oldest_unfinished_batch(&self) -> Option<usize> {
        let layer_plan = self.plan.layer(self.layer)?;
        layer_plan
            .batches
            .iter()
            .find(|batch| batch.tasks.iter().any(|id| !self.is_terminal(id)))
            .map(|batch| batch.index)
    }

    // ========== Dispatch ==========

    fn dispatch(&mut self) -> Result<()> {
        self.requeue_unhealthy_slots();

        let pause_after = if self.config.prioritize_critical_path {
            self.critical_retries
                .iter()
                .filter_map(|id| self.batch_of.get(id))
                .min()
                .copied()
        } else {
            None
        };
        let oldest = self.oldest_unfinished_batch();

        for slot in self.pool.idle_slots() {
            let next = self
                .next_planned(slot, pause_after)
                .or_else(|| self.steal(oldest));
            if let Some(task_id) = next {
                self.start_task(slot, &task_id)?;
            }
        }
        Ok(())
    }

    /// Hand an unhealthy slot's planned tasks to their batch backlogs.
    fn requeue_unhealthy_slots(&mut self) {
        for slot in 0..self.slot_queues.len() {
            if self.pool.is_healthy(slot) || self.slot_queues[slot].is_empty() {
                continue;
            }
            let orphaned: Vec<TaskId> = self.slot_queues[slot].drain(..).collect();
            for id in orphaned {
                let batch = self.batch_of.get(&id).copied().unwrap_or(0);
                self.push_backlog(batch, id);
            }
        }
    }

    fn push_backlog(&mut self, batch: usize, id: TaskId) {
        if self.backlogs.is_empty() {
            self.backlogs.push(VecDeque::new());
        }
        let index = batch.min(self.backlogs.len() - 1);
        self.backlogs[index].push_back(id);
    }

    /// The slot's next planned task, unless its batch is paused.
    fn next_planned(&mut self, slot: usize, pause_after: Option<usize>) -> Option<TaskId> {
        loop {
            let front = self.slot_queues.get(slot)?.front()?.clone();
            if self.status(&front) != Some(TaskStatus::Pending) {
                self.slot_queues[slot].pop_front();
                continue;
            }
            let batch = self.batch_of.get(&front).copied().unwrap_or(0);
            if pause_after.is_some_and(|limit| batch > limit) {
                return None;
            }
            return self.slot_queues[slot].pop_front();
        }
    }

    /// Take work from the backlog of the oldest unfinished batch.
    fn steal(&mut self, oldest: Option<usize>) -> Option<TaskId> {
        let batch = oldest?;
        loop {
            let front = self.backlogs.get(batch)?.front()?.clone();
            self.backlogs[batch].pop_front();
            if self.status(&front) == Some(TaskStatus::Pending) {
                return Some(front);
            }
        }
    }

    fn start_task(&mut self, slot: usize, task_id: &TaskId) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let task = graph
            .task(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
        let event = self
            .tracker
            .transition(task_id, TaskStatus::Running, Some(slot), None)?;
        self.critical_retries.remove(task_id);

        match self
            .pool
            .dispatch(slot, task, event.attempt, self.config.task_timeout)
        {
            Ok(()) => {
                self.tracker
                    .set_worker(slot, WorkerStatus::Busy, Some(task_id.clone()));
                info!(task = %task_id, slot, attempt = event.attempt, "task dispatched");
                Ok(())
            }
            Err(e) => {
                warn!(task = %task_id, slot, error = %e, "worker refused task");
                self.pool.mark_unhealthy(slot);
                self.tracker.set_worker(slot, WorkerStatus::Unhealthy, None);
                self.fail_attempt(task_id, FailureSignal::HealthCheckFailed, Some(e.to_string()))
            }
        }
    }

    // ========== Monitoring ==========

    fn drain_completions(&mut self) -> Result<()> {
        while let Ok(completion) = self.completion_rx.try_recv() {
            self.handle_completion(completion)?;
        }
        Ok(())
    }

    fn handle_completion(&mut self, completion: Completion) -> Result<()> {
        let Completion {
            slot,
            task_id,
            attempt,
        } = completion;

        let cancelling = match self.pool.assignment(slot) {
            Some(assignment) if assignment.matches(&task_id, attempt) => {
                assignment.is_cancelling()
            }
            _ => {
                debug!(task = %task_id, slot, attempt, "ignoring stale completion");
                return Ok(());
            }
        };

        let outcome = self.pool.take_result(slot, &task_id);
        self.free_slot(slot);
        if cancelling {
            // Already handled when the deadline passed.
            debug!(task = %task_id, slot, "late completion after cancel");
            return Ok(());
        }

        match outcome {
            Some(WorkerOutcome::Success) => {
                self.tracker
                    .transition(&task_id, TaskStatus::Completed, None, None)?;
                info!(task = %task_id, slot, attempt, "task completed");
                Ok(())
            }
            Some(WorkerOutcome::Failure(detail)) => {
                self.fail_attempt(&task_id, FailureSignal::ExplicitFailure, Some(detail))
            }
            None => self.fail_attempt(
                &task_id,
                FailureSignal::ExplicitFailure,
                Some("worker reported completion without a result".to_string()),
            ),
        }
    }

    fn free_slot(&mut self, slot: usize) {
        self.pool.release(slot);
        self.tracker.set_worker(slot, WorkerStatus::Idle, None);
    }

    fn retire_slot(&mut self, slot: usize) {
        self.pool.release(slot);
        self.pool.mark_unhealthy(slot);
        self.tracker.set_worker(slot, WorkerStatus::Unhealthy, None);
    }

    /// Fail tasks whose worker reports itself unhealthy mid-run.
    fn check_health(&mut self) -> Result<()> {
        for slot in self.pool.busy_slots() {
            let Some(assignment) = self.pool.assignment(slot).cloned() else {
                continue;
            };
            if assignment.is_cancelling()
                || self.pool.worker_status(slot) != WorkerStatus::Unhealthy
            {
                continue;
            }

            warn!(task = %assignment.task_id, slot, "worker failed health check");
            self.retire_slot(slot);
            self.fail_attempt(
                &assignment.task_id,
                FailureSignal::HealthCheckFailed,
                Some(format!("worker {} failed its health check", slot)),
            )?;
        }
        Ok(())
    }

    /// Cancel overdue tasks and reclaim (or retire) slots being cancelled.
    fn check_timeouts(&mut self) -> Result<()> {
        let now = Instant::now();
        for slot in self.pool.busy_slots() {
            let Some(assignment) = self.pool.assignment(slot).cloned() else {
                continue;
            };

            if let Some(requested) = assignment.cancel_requested_at {
                match self.pool.worker_status(slot) {
                    WorkerStatus::Idle => self.free_slot(slot),
                    status if status == WorkerStatus::Unhealthy
                        || now.duration_since(requested) >= self.config.cancel_grace =>
                    {
                        warn!(slot, task = %assignment.task_id, "worker ignored cancel, retiring slot");
                        self.retire_slot(slot);
                    }
                    _ => {}
                }
                continue;
            }

            if now < assignment.deadline {
                continue;
            }

            warn!(
                task = %assignment.task_id,
                slot,
                attempt = assignment.attempt,
                "task deadline exceeded"
            );
            self.pool.cancel(slot);
            self.fail_attempt(
                &assignment.task_id,
                FailureSignal::DeadlineExceeded,
                Some(format!(
                    "no report within {:?}",
                    self.config.task_timeout
                )),
            )?;
            if self.pool.worker_status(slot) == WorkerStatus::Idle {
                self.free_slot(slot);
            }
        }
        Ok(())
    }

    // ========== Recovery ==========

    fn on_critical_path(&self, task_id: &TaskId) -> bool {
        let finished: HashSet<TaskId> = self
            .graph
            .tasks()
            .filter(|t| self.is_terminal(&t.id))
            .map(|t| t.id.clone())
            .collect();
        self.graph.critical_path(&finished).contains(task_id)
    }

    /// Record a failed attempt of a running task and act on the decision.
    fn fail_attempt(
        &mut self,
        task_id: &TaskId,
        signal: FailureSignal,
        detail: Option<String>,
    ) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let task = graph
            .task(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
        let kind = FailureKind::classify(signal);
        let attempt = self.tracker.attempts(task_id);
        let message = detail.clone().unwrap_or_else(|| kind.to_string());

        let (record, decision) =
            self.recovery
                .handle_failure(&graph, task, kind, attempt, detail);
        self.tracker.record_failure(record);

        match decision {
            RecoveryDecision::Retry {
                delay,
                next_attempt,
            } => {
                warn!(
                    task = %task_id,
                    %kind,
                    attempt,
                    next_attempt,
                    delay_ms = delay.as_millis() as u64,
                    "task failed, retrying"
                );
                if self.config.prioritize_critical_path && self.on_critical_path(task_id) {
                    debug!(task = %task_id, "critical-path retry, holding later batches");
                    self.critical_retries.insert(task_id.clone());
                }
                self.tracker
                    .transition(task_id, TaskStatus::Pending, None, Some(message))?;
                self.retries.push(PendingRetry {
                    task_id: task_id.clone(),
                    ready_at: Instant::now() + delay,
                    batch: self.batch_of.get(task_id).copied().unwrap_or(0),
                });
                Ok(())
            }
            RecoveryDecision::Fail { skip } => {
                error!(task = %task_id, %kind, attempt, error = %message, "task failed");
                self.tracker
                    .transition(task_id, TaskStatus::Failed, None, Some(message))?;
                self.cascade(task_id, &skip)
            }
        }
    }

    /// Fail a task that never ran, then cascade per policy.
    fn fail_unstarted(&mut self, task_id: &TaskId, kind: FailureKind, detail: String) -> Result<()> {
        let attempt = self.tracker.attempts(task_id);
        let record = self.recovery.record(FailureRecord::new(
            task_id.clone(),
            kind,
            attempt,
            Some(detail.clone()),
        ));
        self.tracker.record_failure(record);
        self.tracker
            .transition(task_id, TaskStatus::Failed, None, Some(detail))?;

        let decision = self.recovery.permanent_failure(&self.graph, task_id);
        if let RecoveryDecision::Fail { skip } = decision {
            self.cascade(task_id, &skip)?;
        }
        Ok(())
    }

    fn cascade(&mut self, cause: &TaskId, skip: &[TaskId]) -> Result<()> {
        for id in skip {
            if self.status(id) == Some(TaskStatus::Pending) {
                self.skip_task(id, cause)?;
            }
        }
        Ok(())
    }

    fn skip_task(&mut self, task_id: &TaskId, cause: &TaskId) -> Result<()> {
        let record = self.recovery.record_cascade(task_id, cause);
        let detail = record.detail.clone();
        self.tracker.record_failure(record);
        self.tracker
            .transition(task_id, TaskStatus::Skipped, None, detail)?;
        info!(task = %task_id, cause = %cause, "task skipped");
        Ok(())
    }

    /// Tasks left out of a partial plan fail before anything runs.
    fn fail_rejected(&mut self) -> Result<()> {
        let plan = Arc::clone(&self.plan);
        for rejected in &plan.rejected {
            if self.status(&rejected.task_id) != Some(TaskStatus::Pending) {
                continue;
            }
            warn!(
                task = %rejected.task_id,
                resource = %rejected.resource,
                demand = rejected.demand,
                capacity = rejected.capacity,
                "task cannot be scheduled"
            );
            let detail = format!(
                "unschedulable: demands {} {} but a worker provides {}",
                rejected.demand, rejected.resource, rejected.capacity
            );
            self.fail_unstarted(&rejected.task_id, FailureKind::TaskError, detail)?;
        }
        Ok(())
    }

    fn promote_retries(&mut self) {
        let now = Instant::now();
        let (ready, waiting): (Vec<PendingRetry>, Vec<PendingRetry>) = self
            .retries
            .drain(..)
            .partition(|retry| retry.ready_at <= now);
        self.retries = waiting;

        for retry in ready {
            if self.status(&retry.task_id) == Some(TaskStatus::Pending) {
                debug!(task = %retry.task_id, batch = retry.batch, "retry ready");
                self.push_backlog(retry.batch, retry.task_id);
            }
        }
    }

    /// With every slot out of service, fail the current layer's open tasks and
    /// cascade from each. Later layers are skipped as they are entered.
    fn fail_without_workers(&mut self) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let Some(ids) = graph.layers().get(self.layer) else {
            return Ok(());
        };
        let stranded: Vec<TaskId> = ids
            .iter()
            .filter(|id| !self.is_terminal(id))
            .cloned()
            .collect();
        if stranded.is_empty() {
            return Ok(());
        }

        error!(layer = self.layer, stranded = stranded.len(), "no healthy workers left");
        for slot in self.pool.busy_slots() {
            self.pool.release(slot);
        }
        self.retries.clear();
        self.critical_retries.clear();

        for id in stranded {
            // A cascade from an earlier entry may have settled it already.
            if self.is_terminal(&id) {
                continue;
            }
            self.fail_unstarted(&id, FailureKind::WorkerCrash, "no healthy workers".to_string())?;
        }
        Ok(())
    }

    // ========== Abort ==========

    /// Skip everything pending and stop running workers within the grace
    /// period. Workers that do not stop are retired and their task fails.
    async fn abort(&mut self) -> Result<()> {
        warn!("run aborted");
        self.tracker.mark_aborted();
        self.retries.clear();
        self.critical_retries.clear();

        let graph = Arc::clone(&self.graph);
        for task in graph.tasks() {
            if self.status(&task.id) == Some(TaskStatus::Pending) {
                self.tracker.transition(
                    &task.id,
                    TaskStatus::Skipped,
                    None,
                    Some("run aborted".to_string()),
                )?;
            }
        }

        let mut stopping: Vec<(usize, Option<TaskId>)> = Vec::new();
        for slot in self.pool.busy_slots() {
            let Some(assignment) = self.pool.assignment(slot).cloned() else {
                continue;
            };
            if assignment.is_cancelling() {
                stopping.push((slot, None));
            } else {
                self.pool.cancel(slot);
                stopping.push((slot, Some(assignment.task_id)));
            }
        }

        let deadline = Instant::now() + self.config.cancel_grace;
        loop {
            let mut still_busy = Vec::new();
            for (slot, task_id) in stopping {
                if self.pool.worker_status(slot) != WorkerStatus::Idle {
                    still_busy.push((slot, task_id));
                    continue;
                }
                let outcome = task_id
                    .as_ref()
                    .and_then(|id| self.pool.take_result(slot, id));
                self.free_slot(slot);
                if let Some(id) = task_id {
                    if outcome == Some(WorkerOutcome::Success) {
                        self.tracker
                            .transition(&id, TaskStatus::Completed, None, None)?;
                    } else {
                        self.tracker.transition(
                            &id,
                            TaskStatus::Skipped,
                            None,
                            Some("run aborted".to_string()),
                        )?;
                    }
                }
            }
            stopping = still_busy;

            let now = Instant::now();
            if stopping.is_empty() || now >= deadline {
                break;
            }
            tokio::time::sleep((deadline - now).min(self.config.poll_interval)).await;
        }

        for (slot, task_id) in stopping {
            warn!(slot, "worker did not stop within grace period");
            self.retire_slot(slot);
            if let Some(id) = task_id {
                let attempt = self.tracker.attempts(&id);
                let detail = "worker did not stop within the cancel grace period".to_string();
                let record = self.recovery.record(FailureRecord::new(
                    id.clone(),
                    FailureKind::Cancelled,
                    attempt,
                    Some(detail.clone()),
                ));
                self.tracker.record_failure(record);
                self.tracker
                    .transition(&id, TaskStatus::Failed, None, Some(detail))?;
            }
        }
        Ok(())
    }
}

/// A run in progress.
///
/// Events are delivered on a crossbeam channel so they can be consumed from
/// any thread; the channel disconnects when the run ends.
pub struct RunHandle {
    run_id: Uuid,
    state: StateHandle,
    events: Receiver<StateEvent>,
    cancel: CancellationToken,
    join: JoinHandle<Result<RunSummary>>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Live view of the run's state, still readable after it ends.
    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    pub fn events(&self) -> &Receiver<StateEvent> {
        &self.events
    }

    /// Token that aborts the run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<RunSummary> {
        self.join
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?
    }
}

/// Plans task sets and starts runs on a worker substrate.
pub struct Orchestrator {
    config: RunConfig,
    factory: Arc<dyn WorkerFactory>,
}

impl Orchestrator {
    pub fn new(config: RunConfig, factory: Arc<dyn WorkerFactory>) -> Self {
        Self { config, factory }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Build and plan a task set with this orchestrator's profile.
    pub fn plan(&self, tasks: Vec<Task>) -> Result<PlannedRun> {
        plan_run(
            tasks,
            &self.config.profile,
            self.config.allow_partial_plans,
        )
    }

    /// Start executing a planned run on the current tokio runtime.
    pub fn start(&self, run: &PlannedRun) -> RunHandle {
        let run_id = Uuid::new_v4();
        let state = ExecutionState::new(
            run_id,
            run.graph.tasks().map(|t| t.id.clone()),
            run.plan.profile.max_workers,
        );
        let mut tracker = StateTracker::new(state);
        let events = tracker.subscribe();
        let handle = tracker.handle();
        let cancel = CancellationToken::new();

        let coordinator = Coordinator::new(
            Arc::clone(&run.graph),
            Arc::clone(&run.plan),
            self.config.clone(),
            self.factory.as_ref(),
            tracker,
            cancel.clone(),
        );

        RunHandle {
            run_id,
            state: handle,
            events,
            cancel,
            join: tokio::spawn(coordinator.run()),
        }
    }

    /// Plan and run a task set, waiting for the summary.
    pub async fn execute(&self, tasks: Vec<Task>) -> Result<RunSummary> {
        let run = self.plan(tasks)?;
        self.start(&run).wait().await
    }
}
