// src/sync.rs

//! Tool and blob synchronisation seams for remote execution.
//!
//! Hashing (`hash_tool`, `hash_input_blobs`) must run *before* a remote core
//! is reserved: a worker evicts idle reservations, so the engine never holds
//! one while hashing. Transfers (`synchronise_*`) are given the reserved
//! core and return telemetry that ends up in `TaskPhaseChange` events.

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::descriptor::RemoteInfo;
use crate::errors::Result;
use crate::pool::CoreReservation;

/// Identity of a tool as the remote pool sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolExecutionInfo {
    /// Content hash of the tool binary.
    pub tool_hash: u64,
}

/// Content-addressed view of a task's input files.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InputBundle {
    /// (content hash, local path) pairs for every input blob.
    pub blobs: Vec<(u64, String)>,
}

/// Timing and size metadata for one completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TransferTelemetry {
    pub seconds: f64,
    pub transferred_bytes: u64,
}

pub trait ToolSynchroniser: Send + Sync {
    /// Hash the tool binary. No reservation may be held while this runs.
    fn hash_tool<'a>(
        &'a self,
        tool_local_path: &'a str,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ToolExecutionInfo>> + Send + 'a>>;

    /// Transfer the tool to the reserved core if it is missing there.
    fn synchronise_tool<'a>(
        &'a self,
        core: &'a mut dyn CoreReservation,
        tool: &'a ToolExecutionInfo,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<TransferTelemetry>> + Send + 'a>>;
}

pub trait BlobSynchroniser: Send + Sync {
    /// Hash and stage all input blobs. No reservation may be held while this
    /// runs.
    fn hash_input_blobs<'a>(
        &'a self,
        remote: &'a RemoteInfo,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<InputBundle>> + Send + 'a>>;

    /// Transfer missing input blobs to the reserved core.
    fn synchronise_input_blobs<'a>(
        &'a self,
        core: &'a mut dyn CoreReservation,
        inputs: &'a InputBundle,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<TransferTelemetry>> + Send + 'a>>;

    /// Transfer produced output blobs back after a successful remote run.
    fn synchronise_output_blobs<'a>(
        &'a self,
        core: &'a mut dyn CoreReservation,
        remote: &'a RemoteInfo,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<TransferTelemetry>> + Send + 'a>>;
}
