//! Layering and batch-planning properties.

use std::collections::BTreeSet;
use std::fs;

use tempfile::TempDir;

use strata::core::task::{load_tasks, Task, TaskId};
use strata::core::DependencyGraph;
use strata::orchestration::{plan_run, ExecutionPlan, ResourceProfile};
use strata::Error;

use crate::fixtures::{diamond_tasks, id};

/// A wider graph: three roots, two mid tasks, one sink.
fn wide_tasks() -> Vec<Task> {
    vec![
        Task::new("fetch", "").with_duration(3.0),
        Task::new("lint", "").with_duration(1.0),
        Task::new("deps", "").with_duration(2.0),
        Task::new("build", "")
            .depends_on(["fetch", "deps"])
            .with_duration(5.0),
        Task::new("docs", "").depends_on(["fetch"]).with_duration(1.0),
        Task::new("release", "")
            .depends_on(["build", "docs", "lint"])
            .with_duration(1.0),
    ]
}

#[test]
fn test_layers_partition_tasks() {
    let graph = DependencyGraph::build(wide_tasks()).unwrap();

    let mut seen = BTreeSet::new();
    for layer in graph.layers() {
        for task_id in layer {
            assert!(seen.insert(task_id.clone()), "{} appears twice", task_id);
        }
    }
    let all: BTreeSet<TaskId> = graph.tasks().map(|t| t.id.clone()).collect();
    assert_eq!(seen, all);

    for task in graph.tasks() {
        let layer = graph.layer_of(&task.id).unwrap();
        for dep in &task.dependencies {
            assert!(graph.layer_of(dep).unwrap() < layer);
        }
    }
    assert_eq!(graph.layers()[0], vec![id("deps"), id("fetch"), id("lint")]);
}

#[test]
fn test_replanning_is_deterministic() {
    let profile = ResourceProfile::new(2);
    let first = plan_run(wide_tasks(), &profile, false).unwrap();

    let mut reversed = wide_tasks();
    reversed.reverse();
    let second = plan_run(reversed, &profile, false).unwrap();

    assert_eq!(first.graph.layers(), second.graph.layers());
    assert_eq!(first.plan.layers, second.plan.layers);
    assert_eq!(first.plan.estimates, second.plan.estimates);
}

#[test]
fn test_batches_bounded_by_workers() {
    for workers in 1..=4 {
        let run = plan_run(wide_tasks(), &ResourceProfile::new(workers), false).unwrap();
        let mut planned = 0;
        for batch in run.plan.batches() {
            assert!(batch.tasks.len() <= workers);
            planned += batch.tasks.len();
        }
        assert_eq!(planned, 6);
    }
}

#[test]
fn test_estimates() {
    let run = plan_run(wide_tasks(), &ResourceProfile::new(3), false).unwrap();
    let estimates = &run.plan.estimates;

    assert_eq!(estimates.sequential_duration, 13.0);
    assert_eq!(
        estimates.critical_path,
        vec![id("fetch"), id("build"), id("release")]
    );
    assert_eq!(estimates.critical_path_duration, 9.0);
    // Layer makespans 3 + 5 + 1.
    assert_eq!(estimates.parallel_duration, 9.0);
}

#[test]
fn test_unschedulable_demand_rejected() {
    let profile = ResourceProfile::new(2).with_capacity("gpu", 1.0);
    let tasks = vec![Task::new("train", "").with_resource("gpu", 2.0)];

    match plan_run(tasks.clone(), &profile, false) {
        Err(Error::UnschedulableResourceDemand {
            task_id,
            resource,
            demand,
            capacity,
        }) => {
            assert_eq!(task_id, id("train"));
            assert_eq!(resource, "gpu");
            assert_eq!(demand, 2.0);
            assert_eq!(capacity, 1.0);
        }
        other => panic!("Expected UnschedulableResourceDemand, got {:?}", other.map(|_| ())),
    }

    let partial = plan_run(tasks, &profile, true).unwrap();
    assert!(partial.plan.is_rejected(&id("train")));
    assert!(partial.plan.batches().next().is_none());
}

#[test]
fn test_unknown_dependency_rejected() {
    let tasks = vec![Task::new("a", "").depends_on(["ghost"])];
    assert!(matches!(
        DependencyGraph::build(tasks),
        Err(Error::UnknownDependency { .. })
    ));
}

#[test]
fn test_plan_from_task_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("tasks.toml");
    fs::write(
        &path,
        r#"
[[task]]
id = "a"
name = "root"

[[task]]
id = "b"
depends_on = ["a"]
duration = 2.5

[[task]]
id = "c"
depends_on = ["a"]

[[task]]
id = "d"
dependencies = ["b", "c"]
"#,
    )
    .unwrap();

    let tasks = load_tasks(&path).unwrap();
    let from_file = plan_run(tasks, &ResourceProfile::new(2), false).unwrap();
    let in_code = plan_run(
        diamond_tasks()
            .into_iter()
            .map(|t| if t.id == id("b") { t.with_duration(2.5) } else { t })
            .collect(),
        &ResourceProfile::new(2),
        false,
    )
    .unwrap();

    assert_eq!(from_file.graph.layers(), in_code.graph.layers());
    assert_eq!(from_file.plan.layers, in_code.plan.layers);
}

#[test]
fn test_plan_serializes() {
    let run = plan_run(wide_tasks(), &ResourceProfile::new(2), false).unwrap();
    let json = serde_json::to_string(run.plan.as_ref()).unwrap();
    let parsed: ExecutionPlan = serde_json::from_str(&json).unwrap();
    assert_eq!(&parsed, run.plan.as_ref());
}
