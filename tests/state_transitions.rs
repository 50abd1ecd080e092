//! Status-table transition tests driven directly against `ExecutionState`,
//! without spinning up the executor.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use gridexec::descriptor::{ProcessSpec, TaskDescriptor};
use gridexec::stall::StallMonitor;
use gridexec::{ExecutionState, SchedulingMode, TaskCompletion, TaskKind, TaskStatus};
use gridexec_test_utils::builders::{graph_of, local_chain};
use gridexec_test_utils::init_tracing;

fn diamond() -> std::sync::Arc<gridexec::TaskGraph> {
    graph_of(
        &[
            ("a", TaskKind::Local),
            ("b", TaskKind::Local),
            ("c", TaskKind::Local),
            ("d", TaskKind::Local),
        ],
        &[("b", "a"), ("c", "a"), ("d", "b"), ("d", "c")],
    )
}

#[derive(Default)]
struct CountingStall {
    pings: AtomicUsize,
}

impl StallMonitor for CountingStall {
    fn made_progress(&self) {
        self.pings.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn seeds_only_zero_dependency_tasks() {
    init_tracing();
    let cancel = CancellationToken::new();
    let (state, mut rx) = ExecutionState::new(diamond(), &cancel, None);

    assert_eq!(state.schedule_initial_tasks(), 1);
    assert!(state.any_scheduled());
    assert_eq!(rx.try_recv().unwrap(), "a");
    assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

    let statuses = state.statuses();
    assert_eq!(statuses["a"], TaskStatus::Scheduled);
    assert_eq!(statuses["b"], TaskStatus::Pending);
    assert_eq!(statuses["c"], TaskStatus::Pending);
    assert_eq!(statuses["d"], TaskStatus::Pending);
}

#[test]
fn join_node_is_enqueued_exactly_once() {
    init_tracing();
    let cancel = CancellationToken::new();
    let (state, mut rx) = ExecutionState::new(diamond(), &cancel, None);
    state.schedule_initial_tasks();
    rx.try_recv().unwrap();

    state.finish_task("a", TaskCompletion::Success, SchedulingMode::ByGraphExecution);
    let mut ready = vec![rx.try_recv().unwrap(), rx.try_recv().unwrap()];
    ready.sort();
    assert_eq!(ready, vec!["b", "c"]);

    // One of d's dependencies done: not ready yet.
    state.finish_task("b", TaskCompletion::Success, SchedulingMode::ByGraphExecution);
    assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(state.statuses()["d"], TaskStatus::Pending);

    // Both done: enqueued once, and once only.
    state.finish_task("c", TaskCompletion::Success, SchedulingMode::ByGraphExecution);
    assert_eq!(rx.try_recv().unwrap(), "d");
    assert_eq!(state.statuses()["d"], TaskStatus::Scheduled);
}

#[test]
fn immediately_scheduled_marks_the_dependent_without_enqueueing() {
    init_tracing();
    let cancel = CancellationToken::new();
    let (state, mut rx) = ExecutionState::new(local_chain(&["x", "y"]), &cancel, None);
    state.schedule_initial_tasks();
    rx.try_recv().unwrap();

    let accepted = state.finish_task(
        "x",
        TaskCompletion::Success,
        SchedulingMode::ImmediatelyScheduled,
    );

    assert!(accepted);
    assert_eq!(state.statuses()["y"], TaskStatus::Scheduled);
    assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
}

#[test]
fn handoff_is_refused_while_a_sibling_upstream_is_unfinished() {
    init_tracing();
    let cancel = CancellationToken::new();
    let graph = graph_of(
        &[
            ("x", TaskKind::Describe),
            ("w", TaskKind::Local),
            ("y", TaskKind::Local),
        ],
        &[("y", "x"), ("y", "w")],
    );
    let (state, mut rx) = ExecutionState::new(graph, &cancel, None);
    state.schedule_initial_tasks();
    rx.try_recv().unwrap();
    rx.try_recv().unwrap();

    let accepted = state.finish_task(
        "x",
        TaskCompletion::Success,
        SchedulingMode::ImmediatelyScheduled,
    );

    // y still waits on w, so it must not be claimed for inline execution.
    assert!(!accepted);
    assert_eq!(state.statuses()["x"], TaskStatus::CompletedSuccessfully);
    assert_eq!(state.statuses()["y"], TaskStatus::Pending);
    assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

    // The queue path picks y up once its last dependency lands.
    state.finish_task("w", TaskCompletion::Success, SchedulingMode::ByGraphExecution);
    assert_eq!(rx.try_recv().unwrap(), "y");
    assert_eq!(state.statuses()["y"], TaskStatus::Scheduled);
}

#[test]
fn handoff_cannot_revive_a_cancelled_dependent() {
    init_tracing();
    let cancel = CancellationToken::new();
    let graph = graph_of(
        &[
            ("x", TaskKind::Describe),
            ("w", TaskKind::Local),
            ("y", TaskKind::Local),
        ],
        &[("y", "x"), ("y", "w")],
    );
    let (state, mut rx) = ExecutionState::new(graph, &cancel, None);
    state.schedule_initial_tasks();
    rx.try_recv().unwrap();
    rx.try_recv().unwrap();

    state.finish_task("w", TaskCompletion::Failure, SchedulingMode::ByGraphExecution);
    assert_eq!(state.statuses()["y"], TaskStatus::CancelledUpstream);

    let accepted = state.finish_task(
        "x",
        TaskCompletion::Success,
        SchedulingMode::ImmediatelyScheduled,
    );

    // y's cancellation is terminal; the hand-off must not overwrite it.
    assert!(!accepted);
    assert_eq!(state.statuses()["y"], TaskStatus::CancelledUpstream);
    assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sibling_completions_enqueue_the_join_node_once() {
    init_tracing();
    let cancel = CancellationToken::new();
    let (state, mut rx) = ExecutionState::new(diamond(), &cancel, None);
    state.schedule_initial_tasks();
    assert_eq!(rx.recv().await.unwrap(), "a");
    state.finish_task("a", TaskCompletion::Success, SchedulingMode::ByGraphExecution);
    rx.recv().await.unwrap();
    rx.recv().await.unwrap();

    let finish_b = {
        let state = state.clone();
        tokio::spawn(async move {
            state.finish_task("b", TaskCompletion::Success, SchedulingMode::ByGraphExecution);
        })
    };
    let finish_c = {
        let state = state.clone();
        tokio::spawn(async move {
            state.finish_task("c", TaskCompletion::Success, SchedulingMode::ByGraphExecution);
        })
    };
    finish_b.await.unwrap();
    finish_c.await.unwrap();

    assert_eq!(rx.recv().await.unwrap(), "d");
    assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(state.statuses()["d"], TaskStatus::Scheduled);
}

#[test]
fn failure_cancels_transitive_pending_dependents() {
    init_tracing();
    let cancel = CancellationToken::new();
    let (state, mut rx) = ExecutionState::new(local_chain(&["a", "b", "c"]), &cancel, None);
    state.schedule_initial_tasks();
    rx.try_recv().unwrap();

    state.finish_task("a", TaskCompletion::Failure, SchedulingMode::ByGraphExecution);

    let statuses = state.statuses();
    assert_eq!(statuses["a"], TaskStatus::CompletedUnsuccessfully);
    assert_eq!(statuses["b"], TaskStatus::CancelledUpstream);
    assert_eq!(statuses["c"], TaskStatus::CancelledUpstream);

    // Everything terminal: the queue must be closed.
    assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
}

#[test]
fn concurrent_failures_keep_cancellation_idempotent() {
    init_tracing();
    let cancel = CancellationToken::new();
    // Two roots sharing one dependent.
    let graph = graph_of(
        &[
            ("a", TaskKind::Local),
            ("b", TaskKind::Local),
            ("c", TaskKind::Local),
        ],
        &[("c", "a"), ("c", "b")],
    );
    let (state, mut rx) = ExecutionState::new(graph, &cancel, None);
    state.schedule_initial_tasks();
    rx.try_recv().unwrap();
    rx.try_recv().unwrap();

    state.finish_task("a", TaskCompletion::Failure, SchedulingMode::ByGraphExecution);
    assert_eq!(state.statuses()["c"], TaskStatus::CancelledUpstream);

    // The second failure's walk finds c already cancelled and leaves it be.
    state.finish_task("b", TaskCompletion::Exception, SchedulingMode::ByGraphExecution);
    assert_eq!(state.statuses()["c"], TaskStatus::CancelledUpstream);
    assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
}

#[test]
fn queue_terminates_only_when_nothing_is_in_flight() {
    init_tracing();
    let cancel = CancellationToken::new();
    let graph = graph_of(
        &[("a", TaskKind::Local), ("b", TaskKind::Local)],
        &[],
    );
    let (state, mut rx) = ExecutionState::new(graph, &cancel, None);
    state.schedule_initial_tasks();
    rx.try_recv().unwrap();
    rx.try_recv().unwrap();

    state.finish_task("a", TaskCompletion::Success, SchedulingMode::ByGraphExecution);
    // b is still in flight.
    assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

    state.finish_task("b", TaskCompletion::Success, SchedulingMode::ByGraphExecution);
    assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
    assert!(state.all_completed_successfully());
}

#[test]
fn set_status_rejects_scheduling_and_terminal_statuses() {
    init_tracing();
    let cancel = CancellationToken::new();
    let (state, _rx) = ExecutionState::new(local_chain(&["a"]), &cancel, None);
    state.schedule_initial_tasks();

    state.set_status("a", TaskStatus::Executing);
    assert_eq!(state.statuses()["a"], TaskStatus::Executing);

    // Outcomes must go through finish_task; these are ignored.
    state.set_status("a", TaskStatus::CompletedSuccessfully);
    assert_eq!(state.statuses()["a"], TaskStatus::Executing);
    state.set_status("a", TaskStatus::Pending);
    assert_eq!(state.statuses()["a"], TaskStatus::Executing);
    state.set_status("a", TaskStatus::Scheduled);
    assert_eq!(state.statuses()["a"], TaskStatus::Executing);
}

#[test]
fn first_cancellation_cause_wins() {
    init_tracing();
    let cancel = CancellationToken::new();
    let (state, _rx) = ExecutionState::new(local_chain(&["a"]), &cancel, None);

    assert!(!state.is_cancelled_by_fault());
    state.cancel_build("first fault");
    state.cancel_build("second fault");

    assert!(state.is_cancelled_by_fault());
    assert_eq!(state.fault_message().as_deref(), Some("first fault"));
    assert!(state.cancellation_token().is_cancelled());
    // Caller's own token is unaffected by internal escalation.
    assert!(!cancel.is_cancelled());
}

#[test]
fn caller_cancellation_propagates_to_the_build_token() {
    init_tracing();
    let cancel = CancellationToken::new();
    let (state, _rx) = ExecutionState::new(local_chain(&["a"]), &cancel, None);

    cancel.cancel();
    assert!(state.cancellation_token().is_cancelled());
    assert!(!state.is_cancelled_by_fault());
}

#[test]
fn published_descriptors_reach_direct_dependents() {
    init_tracing();
    let cancel = CancellationToken::new();
    let graph = graph_of(
        &[
            ("x", TaskKind::Describe),
            ("y", TaskKind::Local),
            ("z", TaskKind::Local),
        ],
        &[("y", "x")],
    );
    let (state, _rx) = ExecutionState::new(graph, &cancel, None);

    let descriptor = TaskDescriptor::Local(ProcessSpec {
        command: "clang".to_string(),
        ..ProcessSpec::default()
    });
    state.store_descriptor("x", descriptor);

    let picked = state.descriptor_from_upstream("y").expect("descriptor published");
    assert_eq!(picked.process().command, "clang");
    // z has no descriptor-producing upstream.
    assert!(state.descriptor_from_upstream("z").is_none());
}

/// Monitor that takes status snapshots from inside its callback, the way
/// stall diagnostics do.
#[derive(Default)]
struct InspectingStall {
    target: Mutex<Option<Arc<ExecutionState>>>,
    saw_scheduled: AtomicBool,
}

impl StallMonitor for InspectingStall {
    fn made_progress(&self) {
        if let Some(state) = self.target.lock().unwrap().as_ref() {
            let _ = state.statuses();
            if state.any_scheduled() {
                self.saw_scheduled.store(true, Ordering::SeqCst);
            }
        }
    }
}

#[test]
fn stall_monitor_may_inspect_the_state_it_observes() {
    init_tracing();
    let cancel = CancellationToken::new();
    let stall = Arc::new(InspectingStall::default());
    let (state, mut rx) =
        ExecutionState::new(local_chain(&["a", "b"]), &cancel, Some(stall.clone()));
    *stall.target.lock().unwrap() = Some(state.clone());

    state.schedule_initial_tasks();
    rx.try_recv().unwrap();
    state.set_status("a", TaskStatus::Executing);
    state.finish_task("a", TaskCompletion::Success, SchedulingMode::ByGraphExecution);

    assert!(stall.saw_scheduled.load(Ordering::SeqCst));
}

#[test]
fn transitions_ping_the_stall_monitor() {
    init_tracing();
    let cancel = CancellationToken::new();
    let stall = Arc::new(CountingStall::default());
    let (state, _rx) =
        ExecutionState::new(local_chain(&["a"]), &cancel, Some(stall.clone()));

    state.schedule_initial_tasks();
    state.set_status("a", TaskStatus::Executing);
    state.finish_task("a", TaskCompletion::Success, SchedulingMode::ByGraphExecution);

    assert!(stall.pings.load(Ordering::SeqCst) >= 3);
}
