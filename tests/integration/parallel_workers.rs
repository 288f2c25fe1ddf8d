//! Parallel execution correctness tests.
//!
//! These tests verify that runs use the pool up to its bound and never
//! start a task before its dependencies complete.

use std::sync::Arc;

use strata::core::task::{Task, TaskStatus};
use strata::orchestration::{Orchestrator, RunOutcome, Script, WorkerStatus};

use crate::fixtures::{
    chain_tasks, collect_events, diamond_tasks, fast_config, id, independent_tasks,
    peak_running, simulated, start_order, CountingFactory,
};

fn with_duration(tasks: Vec<Task>, duration: f64) -> Vec<Task> {
    tasks
        .into_iter()
        .map(|t| t.with_duration(duration))
        .collect()
}

/// Test: 4 independent tasks on 4 workers all run at once.
#[tokio::test]
async fn test_parallel_execution_four_workers() {
    let factory = CountingFactory::new();
    let counters = Arc::clone(&factory.counters);
    let orchestrator = Orchestrator::new(fast_config(4), Arc::new(factory));

    let summary = orchestrator
        .execute(with_duration(independent_tasks(4), 5.0))
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(counters.peak(), 4, "All 4 tasks should run concurrently");
}

/// Test: 6 tasks on 3 workers never exceed 3 at a time.
#[tokio::test]
async fn test_parallel_respects_capacity() {
    let factory = CountingFactory::new();
    let counters = Arc::clone(&factory.counters);
    let orchestrator = Orchestrator::new(fast_config(3), Arc::new(factory));
    let run = orchestrator
        .plan(with_duration(independent_tasks(6), 2.0))
        .unwrap();

    let handle = orchestrator.start(&run);
    let events = handle.events().clone();
    let summary = handle.wait().await.unwrap();

    assert_eq!(summary.completed, 6);
    assert_eq!(counters.peak(), 3);
    assert!(peak_running(&collect_events(&events)) <= 3);
    assert_eq!(counters.started().len(), 6);
}

/// Test: a chain runs strictly one task at a time, in order.
#[tokio::test]
async fn test_chain_runs_sequentially() {
    let orchestrator = simulated(fast_config(4), Script::new());
    let run = orchestrator.plan(chain_tasks()).unwrap();
    assert_eq!(run.graph.layers().len(), 3);

    let handle = orchestrator.start(&run);
    let events = handle.events().clone();
    let summary = handle.wait().await.unwrap();

    assert_eq!(summary.completed, 3);
    let events = collect_events(&events);
    assert_eq!(start_order(&events), vec![id("a"), id("b"), id("c")]);
    assert_eq!(peak_running(&events), 1);
}

/// Test: diamond branches overlap, the join waits for both.
#[tokio::test]
async fn test_diamond_branches_overlap() {
    let orchestrator = simulated(fast_config(2), Script::new());
    let run = orchestrator
        .plan(with_duration(diamond_tasks(), 3.0))
        .unwrap();

    let handle = orchestrator.start(&run);
    let events = handle.events().clone();
    let summary = handle.wait().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    let events = collect_events(&events);
    assert_eq!(peak_running(&events), 2);

    let d_started = events
        .iter()
        .position(|e| e.task_id == id("d") && e.to == TaskStatus::Running)
        .unwrap();
    let joined = events
        .iter()
        .filter(|e| e.to == TaskStatus::Completed && (e.task_id == id("b") || e.task_id == id("c")))
        .count();
    let joined_before = events[..d_started]
        .iter()
        .filter(|e| e.to == TaskStatus::Completed && (e.task_id == id("b") || e.task_id == id("c")))
        .count();
    assert_eq!(joined, 2);
    assert_eq!(joined_before, 2);
}

/// Test: the state handle is live during the run and settles afterwards.
#[tokio::test]
async fn test_state_handle_observes_run() {
    let orchestrator = simulated(fast_config(2), Script::new());
    let run = orchestrator
        .plan(with_duration(independent_tasks(2), 20.0))
        .unwrap();
    let handle = orchestrator.start(&run);
    let state = handle.state().clone();

    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    assert_eq!(state.status(&id("t0")), Some(TaskStatus::Running));
    assert!(!handle.is_finished());

    let summary = handle.wait().await.unwrap();
    let snapshot = state.snapshot();
    assert_eq!(snapshot.run_id, summary.run_id);
    assert!(snapshot.is_finished());
    assert!(snapshot.finished_at.is_some());
    assert!(snapshot
        .workers
        .iter()
        .all(|w| w.status == WorkerStatus::Idle && w.current_task.is_none()));
    assert!(summary.parallel_efficiency > 0.0);
}

/// Test: more workers than tasks leaves the extra slots unused.
#[tokio::test]
async fn test_extra_workers_stay_idle() {
    let factory = CountingFactory::new();
    let counters = Arc::clone(&factory.counters);
    let orchestrator = Orchestrator::new(fast_config(8), Arc::new(factory));

    let summary = orchestrator.execute(independent_tasks(3)).await.unwrap();

    assert_eq!(summary.completed, 3);
    let mut slots: Vec<usize> = counters.started().iter().map(|(s, _)| *s).collect();
    slots.sort();
    assert_eq!(slots, vec![0, 1, 2]);
}
