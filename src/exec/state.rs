// src/exec/state.rs

//! Authoritative per-task status table and scheduling decisions for one
//! build.
//!
//! All transitions run under a single exclusive lock, so two tasks finishing
//! concurrently never race on deciding a shared dependent's readiness. The
//! ready-queue is the sender half of an unbounded channel held inside the
//! same lock; dropping it is the graceful termination signal the scheduling
//! loop waits for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::descriptor::TaskDescriptor;
use crate::events::TaskCompletion;
use crate::graph::{TaskGraph, TaskId};
use crate::stall::StallMonitor;

/// Lifecycle status of one task.
///
/// The ordering is meaningful: every status before `CompletedSuccessfully`
/// counts as in-flight, and `set_status` only accepts the in-flight statuses
/// strictly between `Scheduled` and `CompletedSuccessfully`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Starting,
    WaitingForFastLocalCore,
    ComputingDescriptor,
    WaitingForCore,
    Executing,
    CompletedSuccessfully,
    CompletedUnsuccessfully,
    CancelledUpstream,
}

impl TaskStatus {
    pub fn is_in_flight(self) -> bool {
        self < TaskStatus::CompletedSuccessfully
    }

    pub fn is_terminal(self) -> bool {
        !self.is_in_flight()
    }
}

/// How `finish_task` treats a successful task's dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingMode {
    /// Ready dependents are pushed onto the shared ready-queue.
    ByGraphExecution,
    /// The single dependent is marked `Scheduled` without enqueueing; the
    /// caller is about to execute it inline on a handed-off core. Honored
    /// only if the dependent is `Pending` with every dependency completed,
    /// otherwise [`ExecutionState::finish_task`] falls back to the queue.
    ImmediatelyScheduled,
}

struct StatusTable {
    statuses: HashMap<TaskId, TaskStatus>,
    /// Sender half of the ready-queue. Taken (dropped) to terminate it.
    queue_tx: Option<mpsc::UnboundedSender<TaskId>>,
}

/// Execution state for one build job. Created fresh per job, shared across
/// all of its task units, discarded when the scheduling loop observes
/// completion.
pub struct ExecutionState {
    graph: Arc<TaskGraph>,
    table: Mutex<StatusTable>,
    cancel: CancellationToken,
    fault: Mutex<Option<String>>,
    stall: Option<Arc<dyn StallMonitor>>,
    /// Descriptors computed by descriptor-only tasks, keyed by the task that
    /// computed them, awaiting pickup by their dependents.
    descriptors: Mutex<HashMap<TaskId, TaskDescriptor>>,
}

impl ExecutionState {
    /// Create the state for one job, linked to the caller's cancellation
    /// token. Returns the receiver half of the ready-queue.
    pub fn new(
        graph: Arc<TaskGraph>,
        caller_cancel: &CancellationToken,
        stall: Option<Arc<dyn StallMonitor>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TaskId>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let statuses = graph
            .tasks()
            .map(|t| (t.id.clone(), TaskStatus::Pending))
            .collect();

        let state = Arc::new(Self {
            graph,
            table: Mutex::new(StatusTable {
                statuses,
                queue_tx: Some(queue_tx),
            }),
            cancel: caller_cancel.child_token(),
            fault: Mutex::new(None),
            stall,
            descriptors: Mutex::new(HashMap::new()),
        });

        (state, queue_rx)
    }

    /// Shared cancellation token for this build: fires on caller
    /// cancellation and on internal escalation alike.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Mark every zero-dependency task `Scheduled` and push it onto the
    /// ready-queue. Must run once, before any task unit starts. Returns how
    /// many tasks were seeded.
    pub fn schedule_initial_tasks(&self) -> usize {
        let mut seeded = 0;
        {
            let mut table = self.lock_table();
            for spec in self.graph.tasks() {
                if self.graph.upstream_of(&spec.id).is_empty() {
                    table.statuses.insert(spec.id.clone(), TaskStatus::Scheduled);
                    Self::enqueue(&mut table, spec.id.clone());
                    seeded += 1;
                }
            }
        }

        // Pings run outside the lock: a monitor callback is allowed to take
        // a status snapshot.
        for _ in 0..seeded {
            self.ping_stall();
        }
        debug!(seeded, "seeded initial ready tasks");
        seeded
    }

    /// Record in-flight progress for a task.
    ///
    /// Only the statuses strictly between `Scheduled` and
    /// `CompletedSuccessfully` are accepted; anything else is a no-op, since
    /// outcomes must go through [`finish_task`](Self::finish_task).
    pub fn set_status(&self, task: &str, status: TaskStatus) {
        if status > TaskStatus::Scheduled && status < TaskStatus::CompletedSuccessfully {
            self.ping_stall();
            let mut table = self.lock_table();
            if let Some(slot) = table.statuses.get_mut(task) {
                *slot = status;
            } else {
                warn!(task = %task, "set_status for task not in graph; ignoring");
            }
        }
    }

    /// Record a task's terminal outcome and update dependents.
    ///
    /// On success the dependents are either scanned for readiness and
    /// enqueued (`ByGraphExecution`), or the single dependent is marked
    /// `Scheduled` without enqueueing (`ImmediatelyScheduled`, descriptor
    /// hand-off) so the caller can run it inline on the transferred core.
    /// The immediate mode is only honored when that dependent is still
    /// `Pending` and every one of its dependencies has completed
    /// successfully; otherwise this falls back to the queue scan. The return
    /// value reports whether the hand-off was honored.
    ///
    /// On any non-success the task's transitive dependents still `Pending`
    /// become `CancelledUpstream`; dependents already cancelled by a
    /// concurrent failure on another branch are skipped, keeping the walk
    /// idempotent.
    ///
    /// Terminates the ready-queue iff nothing is left in flight afterwards.
    pub fn finish_task(
        &self,
        task: &str,
        completion: TaskCompletion,
        mode: SchedulingMode,
    ) -> bool {
        self.ping_stall();
        let mut handoff_accepted = false;
        let mut transitions = 0usize;
        {
            let mut table = self.lock_table();

            if completion == TaskCompletion::Success {
                table
                    .statuses
                    .insert(task.to_string(), TaskStatus::CompletedSuccessfully);

                let mut mode = mode;
                if mode == SchedulingMode::ImmediatelyScheduled {
                    let dependents = self.graph.downstream_of(task);
                    let exclusive = dependents.len() == 1
                        && table.statuses.get(&dependents[0]) == Some(&TaskStatus::Pending)
                        && self.graph.upstream_of(&dependents[0]).iter().all(|up| {
                            table.statuses.get(up)
                                == Some(&TaskStatus::CompletedSuccessfully)
                        });

                    if exclusive {
                        table
                            .statuses
                            .insert(dependents[0].clone(), TaskStatus::Scheduled);
                        transitions += 1;
                        handoff_accepted = true;
                    } else {
                        debug!(
                            task = %task,
                            "hand-off refused; dependent has other unfinished dependencies"
                        );
                        mode = SchedulingMode::ByGraphExecution;
                    }
                }

                if mode == SchedulingMode::ByGraphExecution {
                    for dependent in self.graph.downstream_of(task) {
                        if table.statuses.get(&dependent) != Some(&TaskStatus::Pending) {
                            continue;
                        }

                        let all_upstream_done = self
                            .graph
                            .upstream_of(&dependent)
                            .iter()
                            .all(|up| {
                                table.statuses.get(up)
                                    == Some(&TaskStatus::CompletedSuccessfully)
                            });

                        if all_upstream_done {
                            debug!(task = %dependent, "dependencies satisfied; scheduling");
                            table
                                .statuses
                                .insert(dependent.clone(), TaskStatus::Scheduled);
                            Self::enqueue(&mut table, dependent);
                            transitions += 1;
                        }
                    }
                }
            } else {
                table
                    .statuses
                    .insert(task.to_string(), TaskStatus::CompletedUnsuccessfully);

                for dependent in self.graph.downstream_transitive(task) {
                    if table.statuses.get(&dependent) == Some(&TaskStatus::Pending) {
                        debug!(
                            task = %dependent,
                            "cancelling dependent due to upstream failure"
                        );
                        table
                            .statuses
                            .insert(dependent, TaskStatus::CancelledUpstream);
                    }
                }
            }

            if !table.statuses.values().any(|s| s.is_in_flight()) {
                debug!("no task remains in flight; terminating ready-queue");
                table.queue_tx = None;
            }
        }

        for _ in 0..transitions {
            self.ping_stall();
        }
        handoff_accepted
    }

    /// Latch the failure cause and cancel the shared token, unblocking every
    /// waiting unit. The first cause wins.
    pub fn cancel_build(&self, cause: impl Into<String>) {
        let cause = cause.into();
        warn!(cause = %cause, "cancelling entire build");
        {
            let mut fault = self.lock_fault();
            if fault.is_none() {
                *fault = Some(cause);
            }
        }
        self.cancel.cancel();
    }

    /// Snapshot of the status table.
    pub fn statuses(&self) -> HashMap<TaskId, TaskStatus> {
        self.lock_table().statuses.clone()
    }

    pub fn all_completed_successfully(&self) -> bool {
        self.lock_table()
            .statuses
            .values()
            .all(|s| *s == TaskStatus::CompletedSuccessfully)
    }

    /// Whether anything sits in the `Scheduled` state right now. Used by
    /// stall diagnostics.
    pub fn any_scheduled(&self) -> bool {
        self.lock_table()
            .statuses
            .values()
            .any(|s| *s == TaskStatus::Scheduled)
    }

    /// True once [`cancel_build`](Self::cancel_build) has run, as opposed to
    /// caller-initiated cancellation.
    pub fn is_cancelled_by_fault(&self) -> bool {
        self.lock_fault().is_some()
    }

    pub fn fault_message(&self) -> Option<String> {
        self.lock_fault().clone()
    }

    /// Publish the descriptor a descriptor-only task computed.
    pub fn store_descriptor(&self, task: &str, descriptor: TaskDescriptor) {
        self.lock_descriptors()
            .insert(task.to_string(), descriptor);
    }

    /// Descriptor computed by a direct descriptor-only upstream of `task`,
    /// if one exists and has published its result.
    pub fn descriptor_from_upstream(&self, task: &str) -> Option<TaskDescriptor> {
        let descriptors = self.lock_descriptors();
        self.graph
            .upstream_of(task)
            .iter()
            .find_map(|up| descriptors.get(up).cloned())
    }

    fn enqueue(table: &mut StatusTable, task: TaskId) {
        if let Some(tx) = &table.queue_tx {
            // Failure means the scheduling loop already went away, which
            // only happens when the build was cancelled.
            let _ = tx.send(task);
        }
    }

    fn ping_stall(&self) {
        if let Some(stall) = &self.stall {
            stall.made_progress();
        }
    }

    fn lock_table(&self) -> MutexGuard<'_, StatusTable> {
        // A unit that panicked mid-transition must not wedge the rest of
        // the build.
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_fault(&self) -> MutexGuard<'_, Option<String>> {
        self.fault.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_descriptors(&self) -> MutexGuard<'_, HashMap<TaskId, TaskDescriptor>> {
        self.descriptors.lock().unwrap_or_else(|e| e.into_inner())
    }
}
