//! Failure handling and recovery tests.
//!
//! These tests verify retry budgets, timeout and crash handling, cascade
//! policies and aborts across whole runs.

use std::time::Duration;

use strata::core::task::{Task, TaskStatus};
use strata::orchestration::{
    Behavior, CascadePolicy, FailureKind, RunOutcome, Script, WorkerStatus,
};

use crate::fixtures::{collect_events, fast_config, id, simulated, start_order};

/// Test: max_retries = R means exactly R + 1 attempts before failing.
#[tokio::test]
async fn test_retry_budget_is_exact() {
    let script = Script::new().always("flaky", Behavior::Fail("boom".to_string()));
    let orchestrator = simulated(fast_config(1), script);
    let run = orchestrator
        .plan(vec![Task::new("flaky", "").idempotent(true)])
        .unwrap();

    let handle = orchestrator.start(&run);
    let state = handle.state().clone();
    let summary = handle.wait().await.unwrap();

    let outcome = summary.task(&id("flaky")).unwrap();
    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.last_error.as_deref(), Some("boom"));

    let snapshot = state.snapshot();
    let attempts: Vec<u32> = snapshot
        .failures_for(&id("flaky"))
        .map(|f| f.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(snapshot
        .failures_for(&id("flaky"))
        .all(|f| f.kind == FailureKind::TaskError));
}

/// Test: a task that is not idempotent is not retried after an explicit
/// failure.
#[tokio::test]
async fn test_non_idempotent_failure_is_final() {
    let script = Script::new().always("once", Behavior::Fail("boom".to_string()));
    let orchestrator = simulated(fast_config(1), script);

    let summary = orchestrator
        .execute(vec![Task::new("once", "")])
        .await
        .unwrap();

    assert_eq!(summary.status(&id("once")), Some(TaskStatus::Failed));
    assert_eq!(summary.task(&id("once")).unwrap().attempts, 1);
    assert_eq!(summary.total_retries, 0);
}

/// Test: a per-task retry limit overrides the policy.
#[tokio::test]
async fn test_per_task_retry_override() {
    let script = Script::new().always("strict", Behavior::Fail("boom".to_string()));
    let orchestrator = simulated(fast_config(1), script);

    let summary = orchestrator
        .execute(vec![Task::new("strict", "")
            .idempotent(true)
            .with_max_retries(0)])
        .await
        .unwrap();

    assert_eq!(summary.task(&id("strict")).unwrap().attempts, 1);
}

/// Test: a crashed worker is retired and the task retries elsewhere.
#[tokio::test]
async fn test_crash_retries_on_another_slot() {
    let script = Script::new().on_attempt("a", 1, Behavior::Crash);
    let orchestrator = simulated(fast_config(2), script);
    let run = orchestrator.plan(vec![Task::new("a", "")]).unwrap();

    let handle = orchestrator.start(&run);
    let state = handle.state().clone();
    let summary = handle.wait().await.unwrap();

    assert_eq!(summary.status(&id("a")), Some(TaskStatus::Completed));
    assert_eq!(summary.task(&id("a")).unwrap().attempts, 2);

    let snapshot = state.snapshot();
    let kinds: Vec<FailureKind> = snapshot.failures_for(&id("a")).map(|f| f.kind).collect();
    assert_eq!(kinds, vec![FailureKind::WorkerCrash]);
    let unhealthy = snapshot
        .workers
        .iter()
        .filter(|w| w.status == WorkerStatus::Unhealthy)
        .count();
    assert_eq!(unhealthy, 1);
}

/// Test: when every worker is gone the stranded task fails and its
/// dependents are skipped under either policy.
#[tokio::test]
async fn test_no_healthy_workers_cascades() {
    for cascade in [CascadePolicy::FailFast, CascadePolicy::BestEffort] {
        let mut config = fast_config(1);
        config.cascade = cascade;
        let script = Script::new().always("a", Behavior::Crash);
        let orchestrator = simulated(config, script);
        let run = orchestrator
            .plan(vec![
                Task::new("a", ""),
                Task::new("b", "").depends_on(["a"]),
                Task::new("c", "").depends_on(["b"]),
            ])
            .unwrap();

        let handle = orchestrator.start(&run);
        let state = handle.state().clone();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.outcome, RunOutcome::CompletedWithFailures);
        assert_eq!(summary.status(&id("a")), Some(TaskStatus::Failed));
        assert_eq!(
            summary.task(&id("a")).unwrap().last_error.as_deref(),
            Some("no healthy workers")
        );
        assert_eq!(summary.status(&id("b")), Some(TaskStatus::Skipped));
        assert_eq!(summary.status(&id("c")), Some(TaskStatus::Skipped));

        let snapshot = state.snapshot();
        for skipped in ["b", "c"] {
            let kinds: Vec<FailureKind> =
                snapshot.failures_for(&id(skipped)).map(|f| f.kind).collect();
            assert_eq!(kinds, vec![FailureKind::DependencySkipCascade], "{}", skipped);
        }
    }
}

/// Test: a later-layer task whose dependencies completed still fails, not
/// hangs, once the pool is gone.
#[tokio::test]
async fn test_no_healthy_workers_fails_later_layers() {
    let mut config = fast_config(1);
    config.cascade = CascadePolicy::BestEffort;
    let script = Script::new().always("b", Behavior::Crash);
    let orchestrator = simulated(config, script);

    // One slot runs the longer "a" first, then "b" crashes it.
    let summary = orchestrator
        .execute(vec![
            Task::new("a", "").with_duration(3.0),
            Task::new("b", "").with_duration(1.0),
            Task::new("c", "").depends_on(["a"]),
            Task::new("d", "").depends_on(["b"]),
        ])
        .await
        .unwrap();

    assert_eq!(summary.status(&id("a")), Some(TaskStatus::Completed));
    assert_eq!(summary.status(&id("b")), Some(TaskStatus::Failed));
    assert_eq!(summary.status(&id("c")), Some(TaskStatus::Failed));
    assert_eq!(
        summary.task(&id("c")).unwrap().last_error.as_deref(),
        Some("no healthy workers")
    );
    assert_eq!(summary.status(&id("d")), Some(TaskStatus::Skipped));
}

/// Test: a worker that ignores cancel is retired after the grace period,
/// while other slots keep working.
#[tokio::test]
async fn test_ignored_cancel_retires_slot() {
    let mut config = fast_config(2);
    config.task_timeout = Duration::from_millis(40);
    config.cancel_grace = Duration::from_millis(40);
    let script = Script::new().always("stuck", Behavior::IgnoreCancel);
    let orchestrator = simulated(config, script);
    let run = orchestrator
        .plan(vec![
            Task::new("stuck", "").with_duration(1.0).with_max_retries(0),
            Task::new("slow", "").with_duration(40.0),
        ])
        .unwrap();

    let handle = orchestrator.start(&run);
    let state = handle.state().clone();
    let summary = handle.wait().await.unwrap();

    assert_eq!(summary.status(&id("stuck")), Some(TaskStatus::Failed));
    assert_eq!(summary.status(&id("slow")), Some(TaskStatus::Completed));

    let snapshot = state.snapshot();
    assert_eq!(
        snapshot.failures_for(&id("stuck")).next().map(|f| f.kind),
        Some(FailureKind::Timeout)
    );
    let slot = run.plan.assignment(&id("stuck")).unwrap();
    assert_eq!(snapshot.workers[slot].status, WorkerStatus::Unhealthy);
}

/// Test: fail-fast skips the failed branch only; independent branches run.
#[tokio::test]
async fn test_cascade_policies_spare_independent_branches() {
    for cascade in [CascadePolicy::FailFast, CascadePolicy::BestEffort] {
        let mut config = fast_config(2);
        config.cascade = cascade;
        let script = Script::new().always("a", Behavior::Fail("bad input".to_string()));
        let orchestrator = simulated(config, script);
        let run = orchestrator
            .plan(vec![
                Task::new("a", ""),
                Task::new("b", "").depends_on(["a"]),
                Task::new("b2", "").depends_on(["b"]),
                Task::new("c", ""),
                Task::new("d", "").depends_on(["c"]),
            ])
            .unwrap();

        let handle = orchestrator.start(&run);
        let state = handle.state().clone();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.status(&id("b")), Some(TaskStatus::Skipped));
        assert_eq!(summary.status(&id("b2")), Some(TaskStatus::Skipped));
        assert_eq!(summary.status(&id("c")), Some(TaskStatus::Completed));
        assert_eq!(summary.status(&id("d")), Some(TaskStatus::Completed));

        let snapshot = state.snapshot();
        let cascade_kind = snapshot.failures_for(&id("b2")).next().map(|f| f.kind);
        assert_eq!(cascade_kind, Some(FailureKind::DependencySkipCascade));
    }
}

/// Test: abort skips pending work and stops running tasks.
#[tokio::test]
async fn test_abort_mid_run() {
    let orchestrator = simulated(fast_config(2), Script::new());
    let run = orchestrator
        .plan(vec![
            Task::new("a", "").with_duration(50.0),
            Task::new("b", "").with_duration(50.0),
            Task::new("c", "").depends_on(["a", "b"]),
        ])
        .unwrap();

    let handle = orchestrator.start(&run);
    let events = handle.events().clone();
    tokio::time::sleep(Duration::from_millis(40)).await;
    handle.abort();
    let summary = handle.wait().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Aborted);
    assert_eq!(summary.skipped, 3);
    assert!(!start_order(&collect_events(&events)).contains(&id("c")));
}

/// Test: on abort, a worker that ignores cancel is retired and its task
/// fails as cancelled.
#[tokio::test]
async fn test_abort_with_ignored_cancel() {
    let mut config = fast_config(2);
    config.cancel_grace = Duration::from_millis(30);
    let script = Script::new().always("stuck", Behavior::IgnoreCancel);
    let orchestrator = simulated(config, script);
    let run = orchestrator
        .plan(vec![
            Task::new("stuck", "").with_duration(1.0),
            Task::new("fine", "").with_duration(50.0),
        ])
        .unwrap();

    let handle = orchestrator.start(&run);
    let state = handle.state().clone();
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.abort();
    let summary = handle.wait().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Aborted);
    assert_eq!(summary.status(&id("stuck")), Some(TaskStatus::Failed));
    assert_eq!(summary.status(&id("fine")), Some(TaskStatus::Skipped));

    let snapshot = state.snapshot();
    let stuck_id = id("stuck");
    let record = snapshot.failures_for(&stuck_id).last().unwrap();
    assert_eq!(record.kind, FailureKind::Cancelled);
    assert_eq!(
        record.detail.as_deref(),
        Some("worker did not stop within the cancel grace period")
    );
    let slot = run.plan.assignment(&id("stuck")).unwrap();
    assert_eq!(snapshot.workers[slot].status, WorkerStatus::Unhealthy);
}

/// Test: a partial plan fails the unschedulable task at run start and
/// cascades to its dependents.
#[tokio::test]
async fn test_unschedulable_task_fails_at_start() {
    let mut config = fast_config(2);
    config.allow_partial_plans = true;
    config.profile = config.profile.with_capacity("memory", 4.0);
    let orchestrator = simulated(config, Script::new());

    let summary = orchestrator
        .execute(vec![
            Task::new("huge", "").with_resource("memory", 16.0),
            Task::new("after", "").depends_on(["huge"]),
            Task::new("fine", "").with_resource("memory", 2.0),
        ])
        .await
        .unwrap();

    assert_eq!(summary.status(&id("huge")), Some(TaskStatus::Failed));
    assert_eq!(summary.task(&id("huge")).unwrap().attempts, 0);
    assert_eq!(summary.status(&id("after")), Some(TaskStatus::Skipped));
    assert_eq!(summary.status(&id("fine")), Some(TaskStatus::Completed));
}
