pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;

pub use config::Config;
pub use crate::core::{DependencyGraph, Task, TaskId, TaskStatus};
pub use error::{Error, Result};
pub use orchestration::{Orchestrator, RunConfig, RunHandle, RunSummary};
