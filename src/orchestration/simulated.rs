//! In-process simulated workers.
//!
//! A `SimulatedWorker` "runs" a task by sleeping for
//! `estimated_duration × time_unit` on the tokio runtime, then reporting the
//! scripted outcome. Scripts can make a particular task (or a particular
//! attempt of it) fail, hang, crash the worker or ignore cancellation, which
//! is how the CLI demo and the test suite exercise recovery paths.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::worker::{
    CompletionNotifier, Worker, WorkerFactory, WorkerOutcome, WorkerStatus,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Scripted behaviour for one task run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Behavior {
    /// Sleep for the estimate, then report success.
    #[default]
    Succeed,
    /// Sleep for the estimate, then report a failure with this detail.
    Fail(String),
    /// Never report. Cancellation stops it.
    Hang,
    /// Sleep for the estimate, then turn unhealthy without reporting.
    Crash,
    /// Never report and ignore cancellation.
    IgnoreCancel,
}

/// Behaviour script shared by every worker a factory creates.
#[derive(Debug, Clone, Default)]
pub struct Script {
    per_attempt: HashMap<(TaskId, u32), Behavior>,
    always: HashMap<TaskId, Behavior>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `behavior` for one specific attempt of a task.
    pub fn on_attempt(mut self, task_id: &str, attempt: u32, behavior: Behavior) -> Self {
        self.per_attempt
            .insert((TaskId::from(task_id), attempt), behavior);
        self
    }

    /// Use `behavior` for every attempt of a task without a specific entry.
    pub fn always(mut self, task_id: &str, behavior: Behavior) -> Self {
        self.always.insert(TaskId::from(task_id), behavior);
        self
    }

    pub fn behavior(&self, task_id: &TaskId, attempt: u32) -> Behavior {
        self.per_attempt
            .get(&(task_id.clone(), attempt))
            .or_else(|| self.always.get(task_id))
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct Inner {
    status: WorkerStatus,
    current: Option<(TaskId, u32, Behavior)>,
    results: HashMap<TaskId, WorkerOutcome>,
}

/// A worker backed by a spawned tokio task.
pub struct SimulatedWorker {
    slot: usize,
    time_unit: Duration,
    script: Arc<Script>,
    inner: Arc<Mutex<Inner>>,
    run: Option<JoinHandle<()>>,
}

impl SimulatedWorker {
    pub fn new(slot: usize, time_unit: Duration, script: Arc<Script>) -> Self {
        Self {
            slot,
            time_unit,
            script,
            inner: Arc::new(Mutex::new(Inner::default())),
            run: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Worker for SimulatedWorker {
    fn start(&mut self, task: &Task, attempt: u32, notifier: CompletionNotifier) -> Result<()> {
        let behavior = self.script.behavior(&task.id, attempt);
        {
            let mut inner = self.lock();
            match inner.status {
                WorkerStatus::Idle => {}
                WorkerStatus::Busy => {
                    return Err(Error::Worker(format!("slot {} is busy", self.slot)));
                }
                WorkerStatus::Unhealthy => {
                    return Err(Error::Worker(format!("slot {} is unhealthy", self.slot)));
                }
            }
            inner.status = WorkerStatus::Busy;
            inner.current = Some((task.id.clone(), attempt, behavior.clone()));
            inner.results.remove(&task.id);
        }

        let run_for =
            Duration::try_from_secs_f64(self.time_unit.as_secs_f64() * task.estimated_duration)
                .unwrap_or(Duration::MAX);
        let inner = Arc::clone(&self.inner);
        let task_id = task.id.clone();

        self.run = Some(tokio::spawn(async move {
            if matches!(behavior, Behavior::Hang | Behavior::IgnoreCancel) {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(run_for).await;

            let outcome = match behavior {
                Behavior::Succeed => WorkerOutcome::Success,
                Behavior::Fail(detail) => WorkerOutcome::Failure(detail),
                _ => {
                    // Crash: go silent and unhealthy.
                    lock(&inner).status = WorkerStatus::Unhealthy;
                    return;
                }
            };

            {
                let mut guard = lock(&inner);
                guard.results.insert(task_id.clone(), outcome);
                guard.status = WorkerStatus::Idle;
                guard.current = None;
            }
            notifier.notify(task_id, attempt).await;
        }));

        Ok(())
    }

    fn cancel(&mut self, task_id: &TaskId) {
        let mut inner = lock(&self.inner);
        let Some((current, _, behavior)) = inner.current.as_ref() else {
            return;
        };
        if current != task_id || *behavior == Behavior::IgnoreCancel {
            return;
        }
        if let Some(run) = self.run.take() {
            run.abort();
        }
        inner.current = None;
        if inner.status == WorkerStatus::Busy {
            inner.status = WorkerStatus::Idle;
        }
    }

    fn status(&self) -> WorkerStatus {
        self.lock().status
    }

    fn result(&mut self, task_id: &TaskId) -> Option<WorkerOutcome> {
        self.lock().results.remove(task_id)
    }
}

impl Drop for SimulatedWorker {
    fn drop(&mut self) {
        if let Some(run) = self.run.take() {
            run.abort();
        }
    }
}

/// Creates [`SimulatedWorker`]s that share one behaviour script.
#[derive(Debug, Clone)]
pub struct SimulatedWorkerFactory {
    time_unit: Duration,
    script: Arc<Script>,
}

impl SimulatedWorkerFactory {
    pub fn new(time_unit: Duration) -> Self {
        Self::with_script(time_unit, Script::new())
    }

    pub fn with_script(time_unit: Duration, script: Script) -> Self {
        Self {
            time_unit,
            script: Arc::new(script),
        }
    }
}

impl WorkerFactory for SimulatedWorkerFactory {
    fn create(&self, slot: usize) -> Box<dyn Worker> {
        Box::new(SimulatedWorker::new(
            slot,
            self.time_unit,
            Arc::clone(&self.script),
        ))
    }
}
