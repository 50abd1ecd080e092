// src/exec/unit.rs

//! Per-task execution unit.
//!
//! One unit drives exactly one dequeued task (plus, on the descriptor
//! hand-off fast path, its single dependent) from `Starting` to a terminal
//! outcome: opportunistic local-core probe, descriptor resolution,
//! pre-reservation hashing, core reservation, remote synchronisation,
//! streamed execution and finalization. Faults never escape the unit; they
//! are classified into a terminal completion, and transport-level faults
//! escalate to whole-build cancellation.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::descriptor::{DescriptorFactory, TaskDescriptor};
use crate::errors::{EngineError, Result};
use crate::events::{EventSink, JobEvent, OutputLine, TaskCompletion, TaskPhase};
use crate::graph::{TaskGraph, TaskId, TaskKind, TaskSpec};
use crate::pool::{CorePreference, CoreReservation, ExecuteRequest, ProcessEvent, WorkerPool};
use crate::sync::{BlobSynchroniser, ToolSynchroniser};

use super::executor::ExecutorOptions;
use super::state::{ExecutionState, SchedulingMode, TaskStatus};

/// Everything a unit needs, shared by all units of one job.
pub(crate) struct UnitContext {
    pub state: Arc<ExecutionState>,
    pub graph: Arc<TaskGraph>,
    pub pool: Arc<dyn WorkerPool>,
    pub tools: Arc<dyn ToolSynchroniser>,
    pub blobs: Arc<dyn BlobSynchroniser>,
    pub factory: Arc<dyn DescriptorFactory>,
    pub events: EventSink,
    pub caller_cancel: CancellationToken,
    pub options: ExecutorOptions,
}

/// Mutable bookkeeping for one task's run through the pipeline.
struct RunBook {
    completion: TaskCompletion,
    exit_code: i32,
    exception: Option<String>,
    started: bool,
    started_at: Option<Instant>,
    handoff: Option<TaskId>,
}

impl Default for RunBook {
    fn default() -> Self {
        Self {
            completion: TaskCompletion::Exception,
            exit_code: 1,
            exception: None,
            started: false,
            started_at: None,
            handoff: None,
        }
    }
}

/// Entry point spawned by the scheduling loop for each dequeued task.
///
/// Loops only when the descriptor hand-off fast path transfers the held
/// core to the single downstream dependent.
pub(crate) async fn run_unit(ctx: Arc<UnitContext>, task: TaskId) {
    let mut current = task;
    let mut inherited: Option<Box<dyn CoreReservation>> = None;

    loop {
        match run_one(&ctx, &current, inherited.take()).await {
            Some((next, core)) => {
                debug!(from = %current, to = %next, "continuing pipeline on handed-off core");
                inherited = Some(core);
                current = next;
            }
            None => break,
        }
    }
}

/// Drive a single task to its terminal completion. Returns the dependent
/// and the held core when the fast path hands off.
async fn run_one(
    ctx: &UnitContext,
    task: &str,
    inherited: Option<Box<dyn CoreReservation>>,
) -> Option<(TaskId, Box<dyn CoreReservation>)> {
    let spec = match ctx.graph.task(task) {
        Some(spec) => spec.clone(),
        None => {
            warn!(task = %task, "dequeued task not present in graph; skipping");
            if let Some(core) = inherited {
                core.release().await;
            }
            return None;
        }
    };

    ctx.state.set_status(&spec.id, TaskStatus::Starting);

    let mut held = inherited;
    let mut run = RunBook::default();

    if let Err(err) = drive(ctx, &spec, &mut held, &mut run).await {
        record_fault(ctx, &spec, &mut run, err);
    }

    finalize(ctx, &spec, held, run).await
}

/// The phase pipeline proper. Any error returned here is classified by
/// [`record_fault`]; cleanup happens in [`finalize`] regardless.
async fn drive(
    ctx: &UnitContext,
    spec: &TaskSpec,
    held: &mut Option<Box<dyn CoreReservation>>,
    run: &mut RunBook,
) -> Result<()> {
    let cancel = ctx.state.cancellation_token().clone();

    // Opportunistic bounded probe for a local core. Failing to get one in
    // time is not an error.
    if held.is_none() && !ctx.options.disable_fast_local_probe {
        ctx.state
            .set_status(&spec.id, TaskStatus::WaitingForFastLocalCore);
        let probe = ctx.pool.reserve_core(CorePreference::RequireLocal, &cancel);
        match tokio::time::timeout(ctx.options.fast_local_probe_timeout, probe).await {
            Ok(Ok(core)) => {
                debug!(task = %spec.id, "fast local probe reserved a core");
                *held = Some(core);
            }
            Ok(Err(err)) => {
                debug!(
                    task = %spec.id,
                    error = %err,
                    "fast local probe failed; continuing without a local core"
                );
            }
            Err(_) => {
                debug!(task = %spec.id, "no local core available within the probe window");
            }
        }
    }

    // Descriptor-only tasks compute and publish their descriptor, then
    // short-circuit straight to success.
    if spec.kind == TaskKind::Describe {
        describe(ctx, spec, held, run, &cancel).await?;
        return Ok(());
    }

    // Resolve the descriptor: either published by a descriptor-only
    // upstream, or computed inline.
    let mut descriptor = match ctx.state.descriptor_from_upstream(&spec.id) {
        Some(descriptor) => descriptor,
        None => {
            ctx.state
                .set_status(&spec.id, TaskStatus::ComputingDescriptor);
            with_cancel(
                &cancel,
                ctx.factory
                    .create_descriptor(spec, held.is_some(), &cancel),
            )
            .await?
        }
    };

    // Remote-capable work hashes the tool and input blobs up front, before
    // any remote reservation exists. A worker evicts idle reservations, so
    // holding one while hashing would lose it.
    if held.is_none() {
        if let TaskDescriptor::Remote { remote, .. } = &mut descriptor {
            let (tool, inputs) = {
                let snapshot = &*remote;
                with_cancel(&cancel, async {
                    tokio::try_join!(
                        ctx.tools.hash_tool(&snapshot.tool_local_path, &cancel),
                        ctx.blobs.hash_input_blobs(snapshot, &cancel),
                    )
                })
                .await?
            };
            remote.tool_execution = Some(tool);
            remote.input_bundle = Some(inputs);
        }
    }

    // Reserve a core unless the probe already got one.
    if held.is_none() {
        ctx.state.set_status(&spec.id, TaskStatus::WaitingForCore);
        let preference = if spec.kind.is_remote_capable() && descriptor.is_remote() {
            CorePreference::PreferRemote
        } else {
            CorePreference::RequireLocal
        };
        let core = with_cancel(&cancel, ctx.pool.reserve_core(preference, &cancel)).await?;
        *held = Some(core);
    }

    let core = held
        .as_deref_mut()
        .ok_or_else(|| EngineError::Reservation("no core held after reservation".to_string()))?;

    run.started_at = Some(Instant::now());
    ctx.events.emit(JobEvent::TaskStarted {
        id: spec.id.clone(),
        caption: spec.caption.clone(),
        worker_machine: core.machine_name().to_string(),
        worker_core: core.core_number(),
    });
    run.started = true;
    ctx.state.set_status(&spec.id, TaskStatus::Executing);

    // Remote cores need the tool and inputs transferred before execution.
    let remote_run = core.is_remote() && descriptor.is_remote();
    if remote_run {
        if let TaskDescriptor::Remote { remote, .. } = &descriptor {
            let tool = remote.tool_execution.as_ref().ok_or_else(|| {
                EngineError::Transport("tool hash missing before tool synchronisation".to_string())
            })?;
            let telemetry =
                with_cancel(&cancel, ctx.tools.synchronise_tool(&mut *core, tool, &cancel))
                    .await?;
            ctx.events.emit(JobEvent::TaskPhaseChange {
                id: spec.id.clone(),
                previous_phase: TaskPhase::SynchronisingTool,
                new_phase: TaskPhase::SynchronisingInputBlobs,
                previous_phase_seconds: telemetry.seconds,
                transferred_bytes: telemetry.transferred_bytes,
            });

            let inputs = remote.input_bundle.as_ref().ok_or_else(|| {
                EngineError::Transport(
                    "input hashes missing before blob synchronisation".to_string(),
                )
            })?;
            let telemetry = with_cancel(
                &cancel,
                ctx.blobs.synchronise_input_blobs(&mut *core, inputs, &cancel),
            )
            .await?;
            ctx.events.emit(JobEvent::TaskPhaseChange {
                id: spec.id.clone(),
                previous_phase: TaskPhase::SynchronisingInputBlobs,
                new_phase: TaskPhase::ExecutingProcess,
                previous_phase_seconds: telemetry.seconds,
                transferred_bytes: telemetry.transferred_bytes,
            });
        }
    }

    // Submit and stream output until the exit code arrives.
    let request = ExecuteRequest {
        descriptor: descriptor.clone(),
        ignore_lines: vec![spec.caption.clone()],
    };
    with_cancel(&cancel, core.submit(request, &cancel)).await?;

    let execution_started = Instant::now();
    loop {
        match with_cancel(&cancel, core.next_event(&cancel)).await? {
            Some(ProcessEvent::StdoutLine(line)) => {
                if line != spec.caption {
                    ctx.events.emit(JobEvent::TaskOutput {
                        id: spec.id.clone(),
                        line: OutputLine::Stdout(line),
                    });
                }
            }
            Some(ProcessEvent::StderrLine(line)) => {
                ctx.events.emit(JobEvent::TaskOutput {
                    id: spec.id.clone(),
                    line: OutputLine::Stderr(line),
                });
            }
            Some(ProcessEvent::Exited(code)) => {
                run.exit_code = code;
                run.completion = if code == 0 {
                    TaskCompletion::Success
                } else {
                    TaskCompletion::Failure
                };
                break;
            }
            None => {
                return Err(EngineError::Transport(
                    "execution stream ended before an exit code".to_string(),
                ));
            }
        }
    }

    // Successful remote runs transfer their outputs back.
    if remote_run && run.completion == TaskCompletion::Success {
        if let TaskDescriptor::Remote { remote, .. } = &descriptor {
            ctx.events.emit(JobEvent::TaskPhaseChange {
                id: spec.id.clone(),
                previous_phase: TaskPhase::ExecutingProcess,
                new_phase: TaskPhase::SynchronisingOutputBlobs,
                previous_phase_seconds: execution_started.elapsed().as_secs_f64(),
                transferred_bytes: 0,
            });
            let telemetry = with_cancel(
                &cancel,
                ctx.blobs.synchronise_output_blobs(&mut *core, remote, &cancel),
            )
            .await?;
            ctx.events.emit(JobEvent::TaskPhaseChange {
                id: spec.id.clone(),
                previous_phase: TaskPhase::SynchronisingOutputBlobs,
                new_phase: TaskPhase::Finalising,
                previous_phase_seconds: telemetry.seconds,
                transferred_bytes: telemetry.transferred_bytes,
            });
        }
    }

    Ok(())
}

/// Descriptor-only task: compute, publish, short-circuit to success, and
/// decide whether to hand the held core to the single dependent.
async fn describe(
    ctx: &UnitContext,
    spec: &TaskSpec,
    held: &Option<Box<dyn CoreReservation>>,
    run: &mut RunBook,
    cancel: &CancellationToken,
) -> Result<()> {
    ctx.state
        .set_status(&spec.id, TaskStatus::ComputingDescriptor);

    // Announce slow preparation work, unless a held local core means the
    // result will be consumed immediately anyway.
    let slow_operation = ctx
        .factory
        .preparation_description()
        .filter(|_| held.is_none());
    let prepare_started = Instant::now();
    if let Some(operation) = &slow_operation {
        ctx.events.emit(JobEvent::TaskPreparing {
            id: spec.id.clone(),
            caption: spec.caption.clone(),
            operation: operation.clone(),
        });
    }

    let descriptor = with_cancel(
        cancel,
        ctx.factory.create_descriptor(spec, held.is_some(), cancel),
    )
    .await?;

    if slow_operation.is_some() {
        ctx.events.emit(JobEvent::TaskPrepared {
            id: spec.id.clone(),
            caption: spec.caption.clone(),
            seconds: prepare_started.elapsed().as_secs_f64(),
            operation: ctx
                .factory
                .preparation_completed_description()
                .unwrap_or_default(),
        });
    }

    ctx.state.store_descriptor(&spec.id, descriptor);

    run.completion = TaskCompletion::Success;
    run.exit_code = 0;

    let mut downstream = ctx.graph.downstream_of(&spec.id);
    if ctx.options.chain_fast_path
        && held.is_some()
        && downstream.len() == 1
        && !cancel.is_cancelled()
    {
        run.handoff = downstream.pop();
    }

    Ok(())
}

/// Always runs, whatever the pipeline did: escalate exceptions, commit or
/// refuse the core hand-off, release the core exactly once, emit the
/// terminal event pair and record the outcome with the execution state.
async fn finalize(
    ctx: &UnitContext,
    spec: &TaskSpec,
    mut held: Option<Box<dyn CoreReservation>>,
    mut run: RunBook,
) -> Option<(TaskId, Box<dyn CoreReservation>)> {
    // Pool state cannot be trusted after an unexpected fault. The cause is
    // latched before the status table gets a chance to terminate the
    // ready-queue, so the scheduling loop never observes termination
    // without the fault already visible.
    if run.completion == TaskCompletion::Exception {
        let cause = run
            .exception
            .clone()
            .unwrap_or_else(|| "unclassified execution fault".to_string());
        ctx.state.cancel_build(cause);
    }

    // The hand-off transfers ownership of the core and elides this task's
    // terminal events. The status table refuses it unless the dependent is
    // exclusively ours (still pending, all of its dependencies finished);
    // a refusal falls back to queue scheduling and normal reporting.
    let mut finished = false;
    if let Some(next) = run.handoff.take() {
        let accepted = ctx.state.finish_task(
            &spec.id,
            run.completion,
            SchedulingMode::ImmediatelyScheduled,
        );
        finished = true;
        if accepted {
            if let Some(core) = held.take() {
                return Some((next, core));
            }
        }
    }

    if let Some(core) = held.take() {
        core.release().await;
    }

    if !run.started {
        // The task never reached a core; start it so the terminal event
        // that follows has a matching start.
        ctx.events.emit(JobEvent::TaskStarted {
            id: spec.id.clone(),
            caption: spec.caption.clone(),
            worker_machine: String::new(),
            worker_core: 0,
        });
    }
    let seconds = run
        .started_at
        .map(|t| t.elapsed().as_secs_f64())
        .unwrap_or(0.0);
    ctx.events.emit(JobEvent::TaskCompleted {
        id: spec.id.clone(),
        caption: spec.caption.clone(),
        completion: run.completion,
        exit_code: run.exit_code,
        exception: run.exception.clone(),
        seconds,
    });

    if !finished {
        ctx.state
            .finish_task(&spec.id, run.completion, SchedulingMode::ByGraphExecution);
    }

    None
}

/// Classify a pipeline error into a terminal completion.
fn record_fault(ctx: &UnitContext, spec: &TaskSpec, run: &mut RunBook, err: EngineError) {
    let cancelled = matches!(err, EngineError::Cancelled)
        || ctx.caller_cancel.is_cancelled()
        || ctx.state.cancellation_token().is_cancelled();

    if cancelled {
        debug!(task = %spec.id, "task observed build cancellation");
        run.completion = TaskCompletion::Cancelled;
        run.exception = None;
    } else {
        error!(task = %spec.id, error = %err, "exception during task execution");
        run.completion = TaskCompletion::Exception;
        run.exception = Some(err.to_string());
    }
}

/// Race a pipeline step against build cancellation, so units unblock even
/// when a collaborator ignores the token it was given.
async fn with_cancel<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        res = fut => res,
    }
}
