//! Topological layering of a validated task set.
//!
//! A layer is a maximal set of tasks whose dependencies all lie in earlier
//! layers. Tasks within one layer are mutually independent and may run in
//! parallel; layer order is the only ordering guarantee the run makes.

use std::collections::{BTreeSet, HashSet};

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};

/// Partition tasks into dependency layers.
///
/// Each pass collects every unassigned task whose dependencies are already
/// assigned to an earlier layer. Ids within a layer are sorted lexically so the
/// output is reproducible regardless of input order.
///
/// # Errors
/// Returns [`Error::LayeringDeadlock`] if unassigned tasks remain but none are
/// ready. The graph builder rejects cycles and unknown ids first, so this
/// only fires on a broken invariant.
pub fn compute_layers<'a, I>(tasks: I) -> Result<Vec<Vec<TaskId>>>
where
    I: IntoIterator<Item = &'a Task>,
{
    let mut pending: Vec<&Task> = tasks.into_iter().collect();
    let mut assigned: HashSet<&TaskId> = HashSet::with_capacity(pending.len());
    let mut layers = Vec::new();

    while !pending.is_empty() {
        let (ready, blocked): (Vec<&Task>, Vec<&Task>) = pending
            .into_iter()
            .partition(|task| task.dependencies.iter().all(|dep| assigned.contains(dep)));

        if ready.is_empty() {
            let remaining: BTreeSet<TaskId> = blocked.iter().map(|t| t.id.clone()).collect();
            return Err(Error::LayeringDeadlock {
                remaining: remaining.into_iter().collect(),
            });
        }

        let mut layer: Vec<TaskId> = ready.iter().map(|t| t.id.clone()).collect();
        layer.sort();
        assigned.extend(ready.into_iter().map(|t| &t.id));
        layers.push(layer);
        pending = blocked;
    }

    Ok(layers)
}
