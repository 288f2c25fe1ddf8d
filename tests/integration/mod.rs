//! Integration test suite for strata.
//!
//! These tests drive whole runs through the public API: graph building,
//! planning, dispatch across the worker pool, retries and cascades.
//!
//! # Test Categories
//!
//! - `scenarios`: The reference scenarios end to end
//! - `parallel_workers`: Concurrency bounds and dependency ordering
//! - `recovery`: Retries, timeouts, crashes and cascade policies
//! - `planning`: Layering and batch-planning properties
//!
//! # CI Compatibility
//!
//! Workers are simulated with millisecond-scale estimates, so the suite runs
//! quickly and needs nothing outside the crate.


mod parallel_workers;
mod planning;
mod recovery;
mod scenarios;
