// src/graph/task.rs

//! Task identity and variant metadata.

use serde::Serialize;

/// Canonical task identifier type used throughout the engine.
pub type TaskId = String;

/// What a task needs from the engine before it can be considered done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskKind {
    /// Computes an execution descriptor for its dependents; runs no process
    /// of its own.
    Describe,
    /// Runs a process that can only execute on a local core.
    Local,
    /// Runs a process that may be dispatched to a remote core.
    Remote,
}

impl TaskKind {
    pub fn is_descriptor_only(self) -> bool {
        matches!(self, TaskKind::Describe)
    }

    pub fn is_remote_capable(self) -> bool {
        matches!(self, TaskKind::Remote)
    }
}

/// Immutable description of one unit of build work.
///
/// The engine treats this as opaque: the descriptor factory knows how to turn
/// it into something runnable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    /// Stable name, unique within one graph.
    pub id: TaskId,
    /// Human-readable caption shown in progress output.
    pub caption: String,
    pub kind: TaskKind,
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>, caption: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id: id.into(),
            caption: caption.into(),
            kind,
        }
    }
}
