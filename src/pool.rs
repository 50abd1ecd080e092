// src/pool.rs

//! Worker pool interface: reservable local and remote execution cores.
//!
//! The pool owns admission and allocation policy; the engine only reserves a
//! core, drives one process on it, and releases it. A reservation is
//! exclusively owned by the task unit holding it and must be released on
//! every exit path (or handed off wholesale to exactly one other task).

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::descriptor::TaskDescriptor;
use crate::errors::Result;

/// Placement preference when asking the pool for a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorePreference {
    /// Only a local core will do (local-only tasks, fast local probe).
    RequireLocal,
    /// Remote-capable work: take a remote core when one is available.
    PreferRemote,
}

/// Streamed event from a process running on a reserved core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    StdoutLine(String),
    StderrLine(String),
    Exited(i32),
}

/// Request submitted to a reserved core.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteRequest {
    pub descriptor: TaskDescriptor,
    /// Output lines to suppress from the stream (e.g. a compiler echoing
    /// the name of the file it was given).
    pub ignore_lines: Vec<String>,
}

/// One reserved execution slot with its bidirectional execution channel.
///
/// Reservations are shared by reference across the await points of one task
/// unit, which tokio may migrate between worker threads, so implementors
/// must be `Sync` as well as `Send`.
pub trait CoreReservation: Send + Sync {
    fn machine_name(&self) -> &str;

    fn core_number(&self) -> u32;

    fn is_remote(&self) -> bool;

    /// Submit the descriptor for execution on this core.
    fn submit<'a>(
        &'a mut self,
        request: ExecuteRequest,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Next streamed process event. `Ok(None)` means the channel closed
    /// without delivering an exit code, which the engine treats as a
    /// transport fault.
    fn next_event<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ProcessEvent>>> + Send + 'a>>;

    /// Return the slot to the pool.
    fn release(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Supplier of reservable cores.
///
/// Reservation may block indefinitely (the pool is the real admission
/// control) and must observe `cancel`. Dropping the returned future before
/// it resolves must not leak a slot.
pub trait WorkerPool: Send + Sync {
    fn reserve_core<'a>(
        &'a self,
        preference: CorePreference,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn CoreReservation>>> + Send + 'a>>;
}
