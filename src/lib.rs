// src/lib.rs

//! gridexec: the execution engine of a distributed build orchestrator.
//!
//! Given a validated dependency graph of build tasks, a [`GraphExecutor`]
//! schedules each task once its prerequisites succeed, dispatches it to a
//! local or remote core from an external worker pool, tracks fine-grained
//! phase progress, streams live results to the caller and contains partial
//! failures without halting independent branches.
//!
//! Graph construction, worker discovery, content transfer mechanics and
//! process spawning all live behind the traits in [`pool`], [`sync`] and
//! [`descriptor`]; this crate only drives opaque, already-describable tasks
//! to completion.

pub mod descriptor;
pub mod errors;
pub mod events;
pub mod exec;
pub mod graph;
pub mod logging;
pub mod pool;
pub mod stall;
pub mod sync;

pub use errors::{EngineError, Result};
pub use events::{EventSink, JobEvent, JobStatus, OutputLine, TaskCompletion, TaskPhase};
pub use exec::{ExecutionState, ExecutorOptions, GraphExecutor, SchedulingMode, TaskStatus};
pub use graph::{TaskGraph, TaskGraphBuilder, TaskId, TaskKind, TaskSpec};
