// src/descriptor.rs

//! Fully-resolved task descriptors and the external factory that produces
//! them.
//!
//! Descriptor computation is a black box to the engine: it may involve
//! preprocessor parsing and can take long enough that the caller wants a
//! progress event around it (see [`DescriptorFactory::preparation_description`]).

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::errors::Result;
use crate::graph::TaskSpec;
use crate::sync::{InputBundle, ToolExecutionInfo};

/// Command line, environment and working directory for one process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessSpec {
    pub command: String,
    pub arguments: Vec<String>,
    pub working_directory: Option<String>,
    pub environment: Vec<(String, String)>,
}

/// Remoting information attached to a remote-capable descriptor.
///
/// `tool_execution` and `input_bundle` start out empty and are filled in by
/// the engine's pre-reservation hashing step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteInfo {
    /// Local path of the tool binary to run on the worker.
    pub tool_local_path: String,
    /// Local paths of the input files the process reads.
    pub input_paths: Vec<String>,
    /// Local paths the process is expected to produce.
    pub output_paths: Vec<String>,
    pub tool_execution: Option<ToolExecutionInfo>,
    pub input_bundle: Option<InputBundle>,
}

/// How to run one task once a core is reserved.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskDescriptor {
    /// Runs on a local core only.
    Local(ProcessSpec),
    /// May run on a remote core after tool/blob synchronisation; falls back
    /// to plain local execution when a local core is used.
    Remote {
        process: ProcessSpec,
        remote: RemoteInfo,
    },
}

impl TaskDescriptor {
    pub fn is_remote(&self) -> bool {
        matches!(self, TaskDescriptor::Remote { .. })
    }

    pub fn process(&self) -> &ProcessSpec {
        match self {
            TaskDescriptor::Local(process) => process,
            TaskDescriptor::Remote { process, .. } => process,
        }
    }
}

/// External factory that resolves a [`TaskSpec`] into a runnable
/// [`TaskDescriptor`].
pub trait DescriptorFactory: Send + Sync {
    /// Description of a slow preparation step, if the factory expects one.
    /// When `Some`, the engine emits `TaskPreparing`/`TaskPrepared` around
    /// descriptor creation unless a local core shortcut applies.
    fn preparation_description(&self) -> Option<String> {
        None
    }

    /// Description used in the matching `TaskPrepared` event.
    fn preparation_completed_description(&self) -> Option<String> {
        None
    }

    fn create_descriptor<'a>(
        &'a self,
        spec: &'a TaskSpec,
        can_use_local_core: bool,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<TaskDescriptor>> + Send + 'a>>;
}
