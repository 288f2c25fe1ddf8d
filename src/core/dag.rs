//! Dependency graph for a run.
//!
//! [`DependencyGraph::build`] validates a declared task set (ids, references,
//! acyclicity), stores it in a petgraph `DiGraph` with edges pointing from a
//! dependency to its dependent, and derives the execution layers and group
//! index once. The graph is immutable after construction.

use crate::core::layers::compute_layers;
use crate::core::task::{validate_duration, Task, TaskId};
use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::LazyLock;

static TASK_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]*$").unwrap());

/// DFS marking used by cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// The validated task dependency graph.
pub struct DependencyGraph {
    /// Nodes are tasks; an edge `a -> b` means `b` depends on `a`.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Execution layers, lexically sorted within each layer.
    layers: Vec<Vec<TaskId>>,
    /// Layer index of every task.
    layer_of: HashMap<TaskId, usize>,
    /// Group name to member ids.
    groups: BTreeMap<String, BTreeSet<TaskId>>,
}

impl DependencyGraph {
    /// Validate a task set and build its graph.
    ///
    /// Checks run in this order: id syntax, duration estimates, duplicate ids,
    /// unresolved dependencies, cycles. Duplicate entries in a dependency list
    /// collapse to their first occurrence.
    ///
    /// # Errors
    /// - [`Error::InvalidTaskId`] for an empty or malformed id
    /// - [`Error::InvalidDuration`] for a negative or non-finite estimate
    /// - [`Error::DuplicateTask`] when two tasks share an id
    /// - [`Error::UnknownDependency`] when a dependency names no task
    /// - [`Error::CyclicDependency`] with the ids on the first cycle found
    pub fn build(tasks: Vec<Task>) -> Result<Self> {
        let mut tasks = tasks;
        let mut seen: HashSet<TaskId> = HashSet::with_capacity(tasks.len());

        for task in &mut tasks {
            if !TASK_ID_RE.is_match(task.id.as_str()) {
                return Err(Error::InvalidTaskId(task.id.0.clone()));
            }
            validate_duration(task)?;
            if !seen.insert(task.id.clone()) {
                return Err(Error::DuplicateTask(task.id.clone()));
            }

            let mut unique = HashSet::with_capacity(task.dependencies.len());
            task.dependencies.retain(|dep| unique.insert(dep.clone()));
        }

        for task in &tasks {
            if let Some(missing) = task.dependencies.iter().find(|dep| !seen.contains(*dep)) {
                return Err(Error::UnknownDependency {
                    task_id: task.id.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        if let Some(cycle) = find_cycle(&tasks) {
            return Err(Error::CyclicDependency { cycle });
        }

        let layers = compute_layers(&tasks)?;
        let layer_of = layers
            .iter()
            .enumerate()
            .flat_map(|(index, layer)| layer.iter().map(move |id| (id.clone(), index)))
            .collect();

        let mut groups: BTreeMap<String, BTreeSet<TaskId>> = BTreeMap::new();
        for task in &tasks {
            if let Some(group) = &task.group {
                groups
                    .entry(group.clone())
                    .or_default()
                    .insert(task.id.clone());
            }
        }

        let mut graph = DiGraph::with_capacity(tasks.len(), 0);
        let mut task_index = HashMap::with_capacity(tasks.len());
        for task in tasks {
            let id = task.id.clone();
            let index = graph.add_node(task);
            task_index.insert(id, index);
        }

        let edges: Vec<(NodeIndex, NodeIndex)> = graph
            .node_indices()
            .flat_map(|index| {
                let task_index = &task_index;
                graph[index]
                    .dependencies
                    .iter()
                    .filter_map(move |dep| task_index.get(dep).map(|&from| (from, index)))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (from, to) in edges {
            graph.add_edge(from, to, ());
        }

        Ok(Self {
            graph,
            task_index,
            layers,
            layer_of,
            groups,
        })
    }

    /// Get a task by id.
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// All tasks, in input order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Direct dependencies of a task, in declaration order.
    pub fn dependencies(&self, id: &TaskId) -> &[TaskId] {
        self.task(id)
            .map(|task| task.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Direct dependents of a task, sorted by id.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut dependents: Vec<TaskId> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .map(|neighbor| self.graph[neighbor].id.clone())
            .collect();
        dependents.sort();
        dependents
    }

    /// Every task reachable downstream of `id`, excluding `id` itself.
    pub fn transitive_dependents(&self, id: &TaskId) -> BTreeSet<TaskId> {
        let mut found = BTreeSet::new();
        let Some(&start) = self.task_index.get(id) else {
            return found;
        };

        let mut queue = VecDeque::from([start]);
        let mut visited = HashSet::from([start]);
        while let Some(index) = queue.pop_front() {
            for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                if visited.insert(next) {
                    found.insert(self.graph[next].id.clone());
                    queue.push_back(next);
                }
            }
        }
        found
    }

    /// Execution layers in order. Layer 0 holds the tasks with no dependencies.
    pub fn layers(&self) -> &[Vec<TaskId>] {
        &self.layers
    }

    /// Index of the layer a task belongs to.
    pub fn layer_of(&self, id: &TaskId) -> Option<usize> {
        self.layer_of.get(id).copied()
    }

    /// Co-location groups declared by tasks.
    pub fn groups(&self) -> &BTreeMap<String, BTreeSet<TaskId>> {
        &self.groups
    }

    /// Sum of all duration estimates: the cost of running everything on one worker.
    pub fn sequential_duration(&self) -> f64 {
        self.graph.node_weights().map(|t| t.estimated_duration).sum()
    }

    /// Longest chain by cumulative estimated duration.
    ///
    /// Tasks in `excluding` (typically the ones already finished) are ignored,
    /// both as chain members and as links. Ties prefer the lexically smaller
    /// id, so the result is deterministic.
    pub fn critical_path(&self, excluding: &HashSet<TaskId>) -> Vec<TaskId> {
        let mut best: HashMap<&TaskId, (f64, Option<&TaskId>)> = HashMap::new();

        for layer in &self.layers {
            for id in layer {
                if excluding.contains(id) {
                    continue;
                }
                let Some(task) = self.task(id) else {
                    continue;
                };

                let mut deps: Vec<&TaskId> = task
                    .dependencies
                    .iter()
                    .filter(|dep| best.contains_key(dep))
                    .collect();
                deps.sort();

                let mut chain: (f64, Option<&TaskId>) = (0.0, None);
                for dep in deps {
                    let length = best[dep].0;
                    if chain.1.is_none() || length > chain.0 {
                        chain = (length, Some(dep));
                    }
                }
                best.insert(id, (chain.0 + task.estimated_duration, chain.1));
            }
        }

        let mut end: Option<(&TaskId, f64)> = None;
        for (id, (length, _)) in &best {
            let better = match end {
                None => true,
                Some((current, current_length)) => {
                    *length > current_length || (*length == current_length && *id < current)
                }
            };
            if better {
                end = Some((*id, *length));
            }
        }

        let mut path = Vec::new();
        let mut cursor = end.map(|(id, _)| id);
        while let Some(id) = cursor {
            path.push(id.clone());
            cursor = best.get(id).and_then(|(_, prev)| *prev);
        }
        path.reverse();
        path
    }

    /// Sum of estimated durations along a chain of tasks.
    pub fn path_duration(&self, path: &[TaskId]) -> f64 {
        path.iter()
            .filter_map(|id| self.task(id))
            .map(|t| t.estimated_duration)
            .sum()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("layers", &self.layers.len())
            .finish()
    }
}

/// Iterative three-colour DFS over "depends on" edges.
///
/// Tasks are visited in input order and dependencies in declaration order.
/// Returns the ids on the first cycle found, starting from the task the
/// traversal re-entered. Assumes every dependency resolves.
fn find_cycle(tasks: &[Task]) -> Option<Vec<TaskId>> {
    let position: HashMap<&TaskId, usize> = tasks
        .iter()
        .enumerate()
        .map(|(index, task)| (&task.id, index))
        .collect();
    let mut marks = vec![Mark::Unvisited; tasks.len()];

    for start in 0..tasks.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }

        // (task position, next dependency to explore)
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        marks[start] = Mark::InProgress;

        while let Some(top) = stack.last_mut() {
            let (node, next) = *top;
            let Some(dep) = tasks[node].dependencies.get(next) else {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            };
            top.1 += 1;

            let Some(&dep_pos) = position.get(dep) else {
                continue;
            };
            match marks[dep_pos] {
                Mark::Unvisited => {
                    marks[dep_pos] = Mark::InProgress;
                    stack.push((dep_pos, 0));
                }
                Mark::InProgress => {
                    let entry = stack
                        .iter()
                        .position(|&(pos, _)| pos == dep_pos)
                        .unwrap_or(0);
                    return Some(
                        stack[entry..]
                            .iter()
                            .map(|&(pos, _)| tasks[pos].id.clone())
                            .collect(),
                    );
                }
                Mark::Done => {}
            }
        }
    }

    None
}
