//! Core domain models for dependency-aware orchestration.
//!
//! This module contains the task model, the validated dependency graph and
//! the layering engine that turns the graph into parallel execution layers.

pub mod dag;
pub mod layers;
pub mod task;

pub use dag::DependencyGraph;
pub use layers::compute_layers;
pub use task::{load_tasks, Resources, Task, TaskId, TaskStatus};
