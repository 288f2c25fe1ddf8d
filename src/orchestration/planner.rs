//! Batch planning.
//!
//! Each dependency layer is packed onto `max_workers` slots with the greedy
//! longest-processing-time rule: tasks are taken longest first and each goes
//! to the least-loaded slot. A slot's tasks run one after another, so a
//! layer's estimated makespan is the heaviest slot load. Batches are the
//! "waves" of that packing: batch *j* holds the *j*-th task of every slot.
//!
//! LPT is an approximation, not an optimum. It always terminates and its
//! estimate never exceeds the sequential one. Planning is pure: the same
//! graph and profile always produce an identical [`ExecutionPlan`].

use crate::core::dag::DependencyGraph;
use crate::core::task::{Resources, Task, TaskId};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Default number of worker slots.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Upper bound on worker slots.
pub const MAX_WORKERS: usize = 1024;

/// Worker slot count and what each slot can provide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceProfile {
    pub max_workers: usize,
    /// Per-slot capacity by resource name. A resource that is not listed
    /// has capacity 0.
    pub per_worker_capacity: Resources,
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            per_worker_capacity: Resources::new(),
        }
    }
}

impl ResourceProfile {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            ..Default::default()
        }
    }

    pub fn with_capacity(mut self, resource: &str, amount: f64) -> Self {
        self.per_worker_capacity.insert(resource.to_string(), amount);
        self
    }

    pub fn capacity(&self, resource: &str) -> f64 {
        self.per_worker_capacity
            .get(resource)
            .copied()
            .unwrap_or(0.0)
    }

    /// # Errors
    /// [`Error::InvalidProfile`] for a worker count outside
    /// `1..=MAX_WORKERS` or a negative / non-finite capacity.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::InvalidProfile(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.max_workers > MAX_WORKERS {
            return Err(Error::InvalidProfile(format!(
                "max_workers must be at most {}, got {}",
                MAX_WORKERS, self.max_workers
            )));
        }
        for (resource, amount) in &self.per_worker_capacity {
            if !amount.is_finite() || *amount < 0.0 {
                return Err(Error::InvalidProfile(format!(
                    "capacity for {} must be a non-negative number, got {}",
                    resource, amount
                )));
            }
        }
        Ok(())
    }

    /// First resource (by name) whose demand exceeds per-slot capacity.
    pub fn excess(&self, task: &Task) -> Option<RejectedTask> {
        task.resources.iter().find_map(|(resource, &demand)| {
            let capacity = self.capacity(resource);
            (demand > capacity).then(|| RejectedTask {
                task_id: task.id.clone(),
                resource: resource.clone(),
                demand,
                capacity,
            })
        })
    }
}

/// A task that no slot can ever run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedTask {
    pub task_id: TaskId,
    pub resource: String,
    pub demand: f64,
    pub capacity: f64,
}

impl From<RejectedTask> for Error {
    fn from(rejected: RejectedTask) -> Self {
        Error::UnschedulableResourceDemand {
            task_id: rejected.task_id,
            resource: rejected.resource,
            demand: rejected.demand,
            capacity: rejected.capacity,
        }
    }
}

/// One wave of a layer: at most one task per slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Layer the batch belongs to.
    pub layer: usize,
    /// Position within the layer.
    pub index: usize,
    /// Tasks in slot order.
    pub tasks: Vec<TaskId>,
    /// Longest task estimate in the batch.
    pub estimated_makespan: f64,
}

/// The packing of one dependency layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerPlan {
    pub index: usize,
    pub batches: Vec<Batch>,
    /// Planned slot of every task in the layer.
    pub assignments: BTreeMap<TaskId, usize>,
    /// Heaviest slot load.
    pub makespan: f64,
}

impl LayerPlan {
    /// Tasks planned for `slot`, in the order the slot runs them.
    pub fn slot_tasks(&self, slot: usize) -> Vec<TaskId> {
        self.batches
            .iter()
            .flat_map(|batch| batch.tasks.iter())
            .filter(|id| self.assignments.get(*id) == Some(&slot))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEstimates {
    /// Sum of layer makespans.
    pub parallel_duration: f64,
    /// Sum of all task estimates.
    pub sequential_duration: f64,
    /// Per resource, the largest summed demand of any single batch.
    pub peak_demand: Resources,
    pub critical_path: Vec<TaskId>,
    pub critical_path_duration: f64,
}

/// Ordered batches for a whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub profile: ResourceProfile,
    pub layers: Vec<LayerPlan>,
    pub estimates: PlanEstimates,
    /// Tasks left out of a partial plan; they fail at run start.
    pub rejected: Vec<RejectedTask>,
}

impl ExecutionPlan {
    /// Plan every layer of `graph`.
    ///
    /// # Errors
    /// [`Error::InvalidProfile`] for a bad profile, and
    /// [`Error::UnschedulableResourceDemand`] for the first task (in input
    /// order) that no slot can run, unless `allow_partial` is set, in which
    /// case such tasks are listed in `rejected` instead.
    pub fn build(
        graph: &DependencyGraph,
        profile: &ResourceProfile,
        allow_partial: bool,
    ) -> Result<Self> {
        profile.validate()?;

        let mut rejected = Vec::new();
        for task in graph.tasks() {
            if let Some(excess) = profile.excess(task) {
                if !allow_partial {
                    return Err(excess.into());
                }
                rejected.push(excess);
            }
        }

        let layers = graph
            .layers()
            .iter()
            .enumerate()
            .map(|(index, ids)| {
                let schedulable: Vec<TaskId> = ids
                    .iter()
                    .filter(|id| !rejected.iter().any(|r| &r.task_id == *id))
                    .cloned()
                    .collect();
                plan_layer(index, &schedulable, graph, profile)
            })
            .collect::<Result<Vec<_>>>()?;

        let critical_path = graph.critical_path(&Default::default());
        let estimates = PlanEstimates {
            parallel_duration: layers.iter().map(|l| l.makespan).sum(),
            sequential_duration: graph.sequential_duration(),
            peak_demand: peak_demand(graph, &layers),
            critical_path_duration: graph.path_duration(&critical_path),
            critical_path,
        };

        debug!(
            layers = layers.len(),
            rejected = rejected.len(),
            parallel = estimates.parallel_duration,
            sequential = estimates.sequential_duration,
            "execution plan built"
        );

        Ok(Self {
            profile: profile.clone(),
            layers,
            estimates,
            rejected,
        })
    }

    /// All batches, layer by layer.
    pub fn batches(&self) -> impl Iterator<Item = &Batch> {
        self.layers.iter().flat_map(|layer| layer.batches.iter())
    }

    pub fn layer(&self, index: usize) -> Option<&LayerPlan> {
        self.layers.get(index)
    }

    /// Planned slot of a task.
    pub fn assignment(&self, task_id: &TaskId) -> Option<usize> {
        self.layers
            .iter()
            .find_map(|layer| layer.assignments.get(task_id).copied())
    }

    pub fn is_rejected(&self, task_id: &TaskId) -> bool {
        self.rejected.iter().any(|r| &r.task_id == task_id)
    }
}

/// Pack one layer onto the profile's slots.
///
/// Tasks are sorted by descending estimate (ties by id) and each is placed
/// on the least-loaded slot (ties by lowest slot index). Capacity is
/// uniform across slots, so any task that passes the demand check fits
/// every slot.
///
/// # Errors
/// [`Error::InvalidProfile`], [`Error::TaskNotFound`] for an id missing
/// from `graph`, or [`Error::UnschedulableResourceDemand`].
pub fn plan_layer(
    layer: usize,
    task_ids: &[TaskId],
    graph: &DependencyGraph,
    profile: &ResourceProfile,
) -> Result<LayerPlan> {
    profile.validate()?;

    let mut tasks = task_ids
        .iter()
        .map(|id| graph.task(id).ok_or_else(|| Error::TaskNotFound(id.clone())))
        .collect::<Result<Vec<&Task>>>()?;
    if let Some(excess) = tasks.iter().find_map(|task| profile.excess(task)) {
        return Err(excess.into());
    }

    tasks.sort_by(|a, b| {
        b.estimated_duration
            .total_cmp(&a.estimated_duration)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut loads = vec![0.0_f64; profile.max_workers];
    let mut bins: Vec<Vec<&Task>> = vec![Vec::new(); profile.max_workers];
    let mut assignments = BTreeMap::new();

    for task in tasks {
        let slot = least_loaded(&loads);
        loads[slot] += task.estimated_duration;
        bins[slot].push(task);
        assignments.insert(task.id.clone(), slot);
    }

    let waves = bins.iter().map(Vec::len).max().unwrap_or(0);
    let batches = (0..waves)
        .map(|wave| {
            let members: Vec<&Task> = bins.iter().filter_map(|bin| bin.get(wave).copied()).collect();
            Batch {
                layer,
                index: wave,
                tasks: members.iter().map(|t| t.id.clone()).collect(),
                estimated_makespan: members
                    .iter()
                    .map(|t| t.estimated_duration)
                    .fold(0.0, f64::max),
            }
        })
        .collect();

    Ok(LayerPlan {
        index: layer,
        batches,
        assignments,
        makespan: loads.iter().copied().fold(0.0, f64::max),
    })
}

fn least_loaded(loads: &[f64]) -> usize {
    let mut best = 0;
    for (slot, load) in loads.iter().enumerate().skip(1) {
        if *load < loads[best] {
            best = slot;
        }
    }
    best
}

fn peak_demand(graph: &DependencyGraph, layers: &[LayerPlan]) -> Resources {
    let mut peak = Resources::new();
    for batch in layers.iter().flat_map(|layer| layer.batches.iter()) {
        let mut demand = Resources::new();
        for task in batch.tasks.iter().filter_map(|id| graph.task(id)) {
            for (resource, amount) in &task.resources {
                *demand.entry(resource.clone()).or_insert(0.0) += amount;
            }
        }
        for (resource, amount) in demand {
            let entry = peak.entry(resource).or_insert(0.0);
            *entry = entry.max(amount);
        }
    }
    peak
}

/// A validated graph together with its plan, ready to execute.
#[derive(Debug, Clone)]
pub struct PlannedRun {
    pub graph: Arc<DependencyGraph>,
    pub plan: Arc<ExecutionPlan>,
}

/// Build the graph for `tasks` and plan it.
///
/// # Errors
/// Any graph-build error, then any planning error.
pub fn plan_run(
    tasks: Vec<Task>,
    profile: &ResourceProfile,
    allow_partial: bool,
) -> Result<PlannedRun> {
    let graph = DependencyGraph::build(tasks)?;
    let plan = ExecutionPlan::build(&graph, profile, allow_partial)?;
    Ok(PlannedRun {
        graph: Arc::new(graph),
        plan: Arc::new(plan),
    })
}
