//! Fake tool/blob synchronisers: count calls, return fixed telemetry, and
//! optionally fail a chosen transfer for fault-injection tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio_util::sync::CancellationToken;

use gridexec::descriptor::RemoteInfo;
use gridexec::errors::{EngineError, Result};
use gridexec::pool::CoreReservation;
use gridexec::sync::{
    BlobSynchroniser, InputBundle, ToolExecutionInfo, ToolSynchroniser, TransferTelemetry,
};

fn telemetry() -> TransferTelemetry {
    TransferTelemetry {
        seconds: 0.01,
        transferred_bytes: 1024,
    }
}

#[derive(Default)]
pub struct FakeToolSynchroniser {
    pub hash_calls: AtomicUsize,
    pub sync_calls: AtomicUsize,
    pub fail_sync: AtomicBool,
}

impl FakeToolSynchroniser {
    pub fn fail_synchronisation(&self) {
        self.fail_sync.store(true, Ordering::SeqCst);
    }
}

impl ToolSynchroniser for FakeToolSynchroniser {
    fn hash_tool<'a>(
        &'a self,
        _tool_local_path: &'a str,
        _cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ToolExecutionInfo>> + Send + 'a>> {
        Box::pin(async move {
            self.hash_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ToolExecutionInfo { tool_hash: 0xf00d })
        })
    }

    fn synchronise_tool<'a>(
        &'a self,
        _core: &'a mut dyn CoreReservation,
        _tool: &'a ToolExecutionInfo,
        _cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<TransferTelemetry>> + Send + 'a>> {
        Box::pin(async move {
            self.sync_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_sync.load(Ordering::SeqCst) {
                return Err(EngineError::Transport(
                    "fake tool transfer failed".to_string(),
                ));
            }
            Ok(telemetry())
        })
    }
}

#[derive(Default)]
pub struct FakeBlobSynchroniser {
    pub hash_calls: AtomicUsize,
    pub input_sync_calls: AtomicUsize,
    pub output_sync_calls: AtomicUsize,
    pub fail_output_sync: AtomicBool,
}

impl FakeBlobSynchroniser {
    pub fn fail_output_synchronisation(&self) {
        self.fail_output_sync.store(true, Ordering::SeqCst);
    }
}

impl BlobSynchroniser for FakeBlobSynchroniser {
    fn hash_input_blobs<'a>(
        &'a self,
        remote: &'a RemoteInfo,
        _cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<InputBundle>> + Send + 'a>> {
        Box::pin(async move {
            self.hash_calls.fetch_add(1, Ordering::SeqCst);
            Ok(InputBundle {
                blobs: remote
                    .input_paths
                    .iter()
                    .enumerate()
                    .map(|(i, path)| (i as u64, path.clone()))
                    .collect(),
            })
        })
    }

    fn synchronise_input_blobs<'a>(
        &'a self,
        _core: &'a mut dyn CoreReservation,
        _inputs: &'a InputBundle,
        _cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<TransferTelemetry>> + Send + 'a>> {
        Box::pin(async move {
            self.input_sync_calls.fetch_add(1, Ordering::SeqCst);
            Ok(telemetry())
        })
    }

    fn synchronise_output_blobs<'a>(
        &'a self,
        _core: &'a mut dyn CoreReservation,
        _remote: &'a RemoteInfo,
        _cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<TransferTelemetry>> + Send + 'a>> {
        Box::pin(async move {
            self.output_sync_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_output_sync.load(Ordering::SeqCst) {
                return Err(EngineError::Transport(
                    "fake output transfer failed".to_string(),
                ));
            }
            Ok(telemetry())
        })
    }
}
