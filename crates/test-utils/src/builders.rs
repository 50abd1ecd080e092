#![allow(dead_code)]

use std::sync::Arc;

use gridexec::{TaskGraph, TaskKind, TaskSpec};

/// Build a `TaskSpec` with a caption derived from its id.
pub fn task(id: &str, kind: TaskKind) -> TaskSpec {
    TaskSpec::new(id, format!("building {id}"), kind)
}

/// Build a graph from `(id, kind)` pairs and `(task, upstream)` dependency
/// edges.
pub fn graph_of(tasks: &[(&str, TaskKind)], edges: &[(&str, &str)]) -> Arc<TaskGraph> {
    let mut builder = TaskGraph::builder();
    for (id, kind) in tasks {
        builder
            .add_task(task(id, *kind))
            .expect("duplicate task id in test graph");
    }
    for (dependent, upstream) in edges {
        builder
            .add_dependency(dependent, upstream)
            .expect("unknown task in test edge");
    }
    Arc::new(builder.build())
}

/// Linear chain of local tasks: `ids[0] <- ids[1] <- ...`.
pub fn local_chain(ids: &[&str]) -> Arc<TaskGraph> {
    let tasks: Vec<(&str, TaskKind)> = ids.iter().map(|id| (*id, TaskKind::Local)).collect();
    let edges: Vec<(&str, &str)> = ids.windows(2).map(|w| (w[1], w[0])).collect();
    graph_of(&tasks, &edges)
}
