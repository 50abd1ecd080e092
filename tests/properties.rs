//! Property tests for the status table: whatever the graph shape and
//! whichever tasks fail, every task terminates, the ready-queue closes, and
//! no dependent of a failure ever reports success.

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use gridexec::{
    ExecutionState, SchedulingMode, TaskCompletion, TaskGraph, TaskKind, TaskSpec, TaskStatus,
};

/// A random DAG over `n` tasks: an edge set over pairs `(i, j)` with
/// `i < j`, so cycles are impossible by construction.
fn dag_strategy() -> impl Strategy<Value = (usize, Vec<(usize, usize)>, Vec<bool>)> {
    (2usize..8).prop_flat_map(|n| {
        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
            .collect();
        let edges = proptest::sample::subsequence(pairs.clone(), 0..=pairs.len());
        let failures = proptest::collection::vec(any::<bool>(), n);
        (Just(n), edges, failures)
    })
}

fn build_graph(n: usize, edges: &[(usize, usize)]) -> Arc<TaskGraph> {
    let mut builder = TaskGraph::builder();
    for i in 0..n {
        builder
            .add_task(TaskSpec::new(
                format!("t{i}"),
                format!("building t{i}"),
                TaskKind::Local,
            ))
            .unwrap();
    }
    for (upstream, dependent) in edges {
        builder
            .add_dependency(&format!("t{dependent}"), &format!("t{upstream}"))
            .unwrap();
    }
    Arc::new(builder.build())
}

/// Tasks that fail directly or sit downstream of a failure.
fn poisoned(n: usize, edges: &[(usize, usize)], failures: &[bool]) -> HashSet<usize> {
    let mut poisoned: HashSet<usize> =
        (0..n).filter(|i| failures[*i]).collect();
    // Edges only point forward, so one ordered pass settles reachability.
    for j in 0..n {
        if edges
            .iter()
            .any(|(up, down)| *down == j && poisoned.contains(up))
        {
            poisoned.insert(j);
        }
    }
    poisoned
}

proptest! {
    #[test]
    fn every_schedule_terminates_and_respects_failures(
        (n, edges, failures) in dag_strategy()
    ) {
        let graph = build_graph(n, &edges);
        let cancel = CancellationToken::new();
        let (state, mut rx) = ExecutionState::new(graph, &cancel, None);
        let seeded = state.schedule_initial_tasks();
        prop_assert!(seeded > 0);

        // Play the scheduler: drain ready tasks and finish each according
        // to the failure script until the queue closes.
        let mut executed = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(task) => {
                    let index: usize = task[1..].parse().unwrap();
                    let completion = if failures[index] {
                        TaskCompletion::Failure
                    } else {
                        TaskCompletion::Success
                    };
                    executed.push(index);
                    state.finish_task(&task, completion, SchedulingMode::ByGraphExecution);
                }
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {
                    prop_assert!(false, "queue stalled with tasks still pending");
                }
            }
        }

        // No task was dispatched twice.
        let distinct: HashSet<usize> = executed.iter().copied().collect();
        prop_assert_eq!(distinct.len(), executed.len());

        let statuses = state.statuses();
        let poisoned = poisoned(n, &edges, &failures);

        for i in 0..n {
            let status = statuses[&format!("t{i}")];
            prop_assert!(status.is_terminal(), "t{} left in {:?}", i, status);

            if failures[i] && executed.contains(&i) {
                prop_assert_eq!(status, TaskStatus::CompletedUnsuccessfully);
            } else if poisoned.contains(&i) {
                prop_assert_ne!(status, TaskStatus::CompletedSuccessfully);
            } else {
                prop_assert_eq!(status, TaskStatus::CompletedSuccessfully);
            }
        }

        if poisoned.is_empty() {
            prop_assert!(state.all_completed_successfully());
        }
    }
}
