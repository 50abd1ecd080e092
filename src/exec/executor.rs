// src/exec/executor.rs

//! Top-level scheduling loop for one build job.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::descriptor::DescriptorFactory;
use crate::errors::{EngineError, Result};
use crate::events::{EventSink, JobEvent, JobStatus};
use crate::graph::TaskGraph;
use crate::pool::WorkerPool;
use crate::stall::StallMonitor;
use crate::sync::{BlobSynchroniser, ToolSynchroniser};

use super::state::ExecutionState;
use super::unit::{UnitContext, run_unit};

/// Tunables for one executor.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Upper bound on the opportunistic local-core probe each task makes
    /// before falling back to the pool.
    pub fast_local_probe_timeout: Duration,
    /// Skip the probe entirely (e.g. when tracing a build).
    pub disable_fast_local_probe: bool,
    /// Let a descriptor-only task holding a local core continue straight
    /// into its single downstream dependent instead of going back through
    /// the ready-queue. Off by default.
    pub chain_fast_path: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            fast_local_probe_timeout: Duration::from_millis(250),
            disable_fast_local_probe: false,
            chain_fast_path: false,
        }
    }
}

/// Drives a validated task graph to completion against a worker pool,
/// streaming progress to an [`EventSink`].
pub struct GraphExecutor {
    pool: Arc<dyn WorkerPool>,
    tools: Arc<dyn ToolSynchroniser>,
    blobs: Arc<dyn BlobSynchroniser>,
    factory: Arc<dyn DescriptorFactory>,
    stall: Option<Arc<dyn StallMonitor>>,
    options: ExecutorOptions,
}

impl GraphExecutor {
    pub fn new(
        pool: Arc<dyn WorkerPool>,
        tools: Arc<dyn ToolSynchroniser>,
        blobs: Arc<dyn BlobSynchroniser>,
        factory: Arc<dyn DescriptorFactory>,
    ) -> Self {
        Self {
            pool,
            tools,
            blobs,
            factory,
            stall: None,
            options: ExecutorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_stall_monitor(mut self, monitor: Arc<dyn StallMonitor>) -> Self {
        self.stall = Some(monitor);
        self
    }

    /// Execute the whole graph.
    ///
    /// Resolves to the overall job status once every task reached a
    /// terminal state, or to `EngineError::Cancelled` when the caller's
    /// token fired. An internally-escalated cancellation (a task fault)
    /// waits for in-flight units to finish reporting, then emits a single
    /// failing `JobComplete` carrying the captured cause.
    pub async fn execute(
        &self,
        graph: Arc<TaskGraph>,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Result<JobStatus> {
        if graph.is_empty() {
            return Err(EngineError::InvalidGraph(
                "no tasks defined in the graph".to_string(),
            ));
        }
        if graph.roots().is_empty() {
            return Err(EngineError::InvalidGraph(
                "no task in the graph is immediately schedulable".to_string(),
            ));
        }

        let job_started = Instant::now();
        let (state, mut ready_rx) = ExecutionState::new(graph.clone(), &cancel, self.stall.clone());
        state.schedule_initial_tasks();

        let ctx = Arc::new(UnitContext {
            state: state.clone(),
            graph,
            pool: self.pool.clone(),
            tools: self.tools.clone(),
            blobs: self.blobs.clone(),
            factory: self.factory.clone(),
            events: events.clone(),
            caller_cancel: cancel.clone(),
            options: self.options.clone(),
        });

        info!("graph execution started");

        let build_cancel = state.cancellation_token().clone();
        let mut units: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                _ = build_cancel.cancelled() => break,
                next = ready_rx.recv() => match next {
                    Some(task) => {
                        debug!(task = %task, "dequeued ready task; spawning execution unit");
                        units.push(tokio::spawn(run_unit(ctx.clone(), task)));
                    }
                    // Queue terminated: every task reached a terminal status.
                    None => break,
                }
            }
        }

        if cancel.is_cancelled() {
            // Caller-initiated: propagate without synthesizing a completion
            // event for a stream the caller already abandoned.
            info!("graph execution cancelled by caller");
            return Err(EngineError::Cancelled);
        }

        let seconds = job_started.elapsed().as_secs_f64();

        if state.is_cancelled_by_fault() {
            // Let in-flight units finish so their task-level failures reach
            // the stream before the job-level verdict.
            for unit in units {
                let _ = unit.await;
            }
            let exception = state.fault_message();
            info!(?exception, "graph execution failed due to an escalated fault");
            events.emit(JobEvent::JobComplete {
                status: JobStatus::Failure,
                seconds,
                exception,
            });
            return Ok(JobStatus::Failure);
        }

        let status = if state.all_completed_successfully() {
            JobStatus::Success
        } else {
            JobStatus::Failure
        };
        info!(?status, "graph execution finished");
        events.emit(JobEvent::JobComplete {
            status,
            seconds,
            exception: None,
        });
        Ok(status)
    }
}
