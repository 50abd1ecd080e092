//! Fake descriptor factory.
//!
//! Descriptors it produces use the task id as the process command, so the
//! fake pool can script per-task behaviour by command name.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use gridexec::descriptor::{DescriptorFactory, ProcessSpec, RemoteInfo, TaskDescriptor};
use gridexec::errors::{EngineError, Result};
use gridexec::graph::{TaskKind, TaskSpec};

#[derive(Default)]
pub struct FakeDescriptorFactory {
    preparation: Option<(String, String)>,
    delay: Option<Duration>,
    fail_for: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl FakeDescriptorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a slow preparation step so the engine emits
    /// `TaskPreparing`/`TaskPrepared` pairs.
    pub fn with_preparation(mut self, operation: &str, completed: &str) -> Self {
        self.preparation = Some((operation.to_string(), completed.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make descriptor creation fail for the given task.
    pub fn fail_for(&self, task: &str) {
        self.fail_for.lock().unwrap().insert(task.to_string());
    }

    /// Task ids descriptors were created for, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl DescriptorFactory for FakeDescriptorFactory {
    fn preparation_description(&self) -> Option<String> {
        self.preparation.as_ref().map(|(op, _)| op.clone())
    }

    fn preparation_completed_description(&self) -> Option<String> {
        self.preparation.as_ref().map(|(_, done)| done.clone())
    }

    fn create_descriptor<'a>(
        &'a self,
        spec: &'a TaskSpec,
        _can_use_local_core: bool,
        _cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<TaskDescriptor>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            self.calls.lock().unwrap().push(spec.id.clone());

            if self.fail_for.lock().unwrap().contains(&spec.id) {
                return Err(EngineError::Descriptor(format!(
                    "fake descriptor failure for '{}'",
                    spec.id
                )));
            }

            let process = ProcessSpec {
                command: spec.id.clone(),
                ..ProcessSpec::default()
            };

            let descriptor = match spec.kind {
                TaskKind::Remote => TaskDescriptor::Remote {
                    process,
                    remote: RemoteInfo {
                        tool_local_path: format!("/tools/{}", spec.id),
                        input_paths: vec![format!("{}.input", spec.id)],
                        output_paths: vec![format!("{}.obj", spec.id)],
                        ..RemoteInfo::default()
                    },
                },
                TaskKind::Describe | TaskKind::Local => TaskDescriptor::Local(process),
            };

            Ok(descriptor)
        })
    }
}
