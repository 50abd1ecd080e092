// src/events.rs

//! Typed job event stream delivered to the caller.
//!
//! Per-task event order is causal (`TaskStarted` before its `TaskOutput`
//! lines, `TaskCompleted` last); interleaving between different tasks is
//! unconstrained. Every task that enters the engine receives a terminal
//! `TaskCompleted`, with one exception: a descriptor-only task whose result
//! is handed directly to its downstream dependent.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::graph::TaskId;

/// Overall outcome of one build job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Success,
    Failure,
}

/// Terminal outcome of one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskCompletion {
    Success,
    Failure,
    Cancelled,
    Exception,
}

/// Named stage of a task's execution lifecycle, reported for progress and
/// timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskPhase {
    SynchronisingTool,
    SynchronisingInputBlobs,
    ExecutingProcess,
    SynchronisingOutputBlobs,
    Finalising,
}

/// One streamed line of process output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            OutputLine::Stdout(s) | OutputLine::Stderr(s) => s,
        }
    }
}

/// Events produced while a job executes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum JobEvent {
    /// A slow descriptor-computation step is starting.
    TaskPreparing {
        id: TaskId,
        caption: String,
        operation: String,
    },
    /// The slow descriptor-computation step finished.
    TaskPrepared {
        id: TaskId,
        caption: String,
        seconds: f64,
        operation: String,
    },
    /// The task has a reserved core and is about to do real work. A task
    /// that faulted before reserving still emits this, with an empty worker
    /// identity, so started/completed events always pair up.
    TaskStarted {
        id: TaskId,
        caption: String,
        worker_machine: String,
        worker_core: u32,
    },
    /// The task moved to a new lifecycle phase; carries timing and transfer
    /// telemetry for the phase just completed.
    TaskPhaseChange {
        id: TaskId,
        previous_phase: TaskPhase,
        new_phase: TaskPhase,
        previous_phase_seconds: f64,
        transferred_bytes: u64,
    },
    /// One line of live process output.
    TaskOutput { id: TaskId, line: OutputLine },
    /// Terminal event for one task.
    TaskCompleted {
        id: TaskId,
        caption: String,
        completion: TaskCompletion,
        exit_code: i32,
        exception: Option<String>,
        seconds: f64,
    },
    /// Terminal event for the whole job.
    JobComplete {
        status: JobStatus,
        seconds: f64,
        exception: Option<String>,
    },
}

/// Cloneable handle used by the engine to publish [`JobEvent`]s.
///
/// Backed by an unbounded channel: emitting never blocks a task unit, and a
/// caller that stops listening simply causes further events to be dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: JobEvent) {
        if self.tx.send(event).is_err() {
            debug!("event receiver dropped; discarding job event");
        }
    }
}
