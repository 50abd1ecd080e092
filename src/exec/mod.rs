// src/exec/mod.rs

//! Execution engine.
//!
//! - [`state`] holds the per-build status table, ready-queue and
//!   cancellation latch.
//! - [`unit`] drives one task through its phase pipeline.
//! - [`executor`] owns the scheduling loop and job lifecycle.

pub mod executor;
pub mod state;
mod unit;

pub use executor::{ExecutorOptions, GraphExecutor};
pub use state::{ExecutionState, SchedulingMode, TaskStatus};
