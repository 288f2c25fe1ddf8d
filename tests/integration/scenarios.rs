//! Reference scenarios, end to end.

use std::sync::Arc;

use strata::core::task::{Task, TaskStatus};
use strata::orchestration::{
    Behavior, CascadePolicy, FailureKind, Orchestrator, RunOutcome, Script,
};
use strata::Error;

use crate::fixtures::{
    collect_events, fast_config, id, simulated, start_order, CountingFactory,
};

/// Scenario 1: A and B are independent, C depends on both.
/// With two workers the plan is one batch of [A, B] then one of [C].
#[tokio::test]
async fn test_two_roots_then_join() {
    let tasks = vec![
        Task::new("a", "A"),
        Task::new("b", "B"),
        Task::new("c", "C").depends_on(["a", "b"]),
    ];
    let orchestrator = simulated(fast_config(2), Script::new());
    let run = orchestrator.plan(tasks).unwrap();

    assert_eq!(
        run.graph.layers(),
        &[vec![id("a"), id("b")], vec![id("c")]]
    );
    let batches: Vec<_> = run.plan.batches().map(|b| b.tasks.clone()).collect();
    assert_eq!(batches, vec![vec![id("a"), id("b")], vec![id("c")]]);
    assert_ne!(run.plan.assignment(&id("a")), run.plan.assignment(&id("b")));

    let handle = orchestrator.start(&run);
    let events = handle.events().clone();
    let summary = handle.wait().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    let events = collect_events(&events);
    let order = start_order(&events);
    assert_eq!(order.len(), 3);
    assert_eq!(order[2], id("c"));

    let c_started = events
        .iter()
        .position(|e| e.task_id == id("c") && e.to == TaskStatus::Running)
        .unwrap();
    for dep in ["a", "b"] {
        let done = events
            .iter()
            .position(|e| e.task_id == id(dep) && e.to == TaskStatus::Completed)
            .unwrap();
        assert!(done < c_started, "{} must complete before c starts", dep);
    }
}

/// Scenario 2: A and B depend on each other.
#[tokio::test]
async fn test_mutual_dependency_is_rejected() {
    let tasks = vec![
        Task::new("a", "A").depends_on(["b"]),
        Task::new("b", "B").depends_on(["a"]),
    ];
    let orchestrator = simulated(fast_config(2), Script::new());

    match orchestrator.plan(tasks) {
        Err(Error::CyclicDependency { cycle }) => {
            let mut members = cycle.clone();
            members.sort();
            members.dedup();
            assert_eq!(members, vec![id("a"), id("b")]);
        }
        other => panic!("Expected CyclicDependency, got {:?}", other.map(|_| ())),
    }
}

/// Scenario 3: A times out twice with max_retries = 2, then succeeds.
#[tokio::test]
async fn test_timeouts_then_success() {
    let mut config = fast_config(1);
    config.task_timeout = std::time::Duration::from_millis(60);
    let script = Script::new()
        .on_attempt("a", 1, Behavior::Hang)
        .on_attempt("a", 2, Behavior::Hang);
    let orchestrator = simulated(config, script);
    let run = orchestrator.plan(vec![Task::new("a", "A")]).unwrap();

    let handle = orchestrator.start(&run);
    let state = handle.state().clone();
    let summary = handle.wait().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    let outcome = summary.task(&id("a")).unwrap();
    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(summary.total_retries, 2);

    let snapshot = state.snapshot();
    let kinds: Vec<FailureKind> = snapshot.failures_for(&id("a")).map(|f| f.kind).collect();
    assert_eq!(kinds, vec![FailureKind::Timeout, FailureKind::Timeout]);
}

/// Scenario 4: A fails permanently and B depends on it. B ends skipped under
/// either cascade policy because its only dependency did not complete.
#[tokio::test]
async fn test_failed_dependency_skips_dependent() {
    for cascade in [CascadePolicy::FailFast, CascadePolicy::BestEffort] {
        let mut config = fast_config(2);
        config.cascade = cascade;
        let script = Script::new().always("a", Behavior::Fail("exit 1".to_string()));
        let orchestrator = simulated(config, script);
        let run = orchestrator
            .plan(vec![
                Task::new("a", "A"),
                Task::new("b", "B").depends_on(["a"]),
            ])
            .unwrap();

        let handle = orchestrator.start(&run);
        let events = handle.events().clone();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.outcome, RunOutcome::CompletedWithFailures);
        assert_eq!(summary.status(&id("a")), Some(TaskStatus::Failed));
        assert_eq!(summary.status(&id("b")), Some(TaskStatus::Skipped));
        assert!(
            !start_order(&collect_events(&events)).contains(&id("b")),
            "b must never run under {:?}",
            cascade
        );
        assert_eq!(
            summary.task(&id("a")).unwrap().last_error.as_deref(),
            Some("exit 1")
        );
    }
}

/// Scenario 5: durations [10, 1, 1, 1, 1] on two workers. The long task runs
/// alone on one slot, the short ones run back to back on the other.
#[tokio::test]
async fn test_long_task_runs_alone() {
    let tasks = vec![
        Task::new("a", "long").with_duration(10.0),
        Task::new("b", "short").with_duration(1.0),
        Task::new("c", "short").with_duration(1.0),
        Task::new("d", "short").with_duration(1.0),
        Task::new("e", "short").with_duration(1.0),
    ];
    let factory = CountingFactory::new();
    let counters = Arc::clone(&factory.counters);
    let orchestrator = Orchestrator::new(fast_config(2), Arc::new(factory));
    let run = orchestrator.plan(tasks).unwrap();

    let layer = &run.plan.layers[0];
    assert_eq!(layer.makespan, 10.0);
    assert_eq!(layer.slot_tasks(0), vec![id("a")]);
    assert_eq!(
        layer.slot_tasks(1),
        vec![id("b"), id("c"), id("d"), id("e")]
    );

    let summary = orchestrator.start(&run).wait().await.unwrap();
    assert_eq!(summary.completed, 5);

    let started = counters.started();
    let on_slot = |slot: usize| -> Vec<_> {
        started
            .iter()
            .filter(|(s, _)| *s == slot)
            .map(|(_, t)| t.clone())
            .collect()
    };
    assert_eq!(on_slot(0), vec![id("a")]);
    assert_eq!(on_slot(1), vec![id("b"), id("c"), id("d"), id("e")]);
    assert_eq!(counters.peak(), 2);
}
