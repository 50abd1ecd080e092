// src/graph/mod.rs

//! Immutable task graph with derived adjacency queries.
//!
//! Tasks are held in flat petgraph storage and addressed by stable string
//! ids; the upstream/downstream indices are built once at construction and
//! never mutated while units execute. Cycle-freedom is assumed rather than
//! checked here; the graph builder that produces the job is responsible for
//! validating it.

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::errors::{EngineError, Result};

pub mod task;

pub use task::{TaskId, TaskKind, TaskSpec};

/// Directed acyclic graph of build tasks.
///
/// An edge `upstream -> downstream` means `downstream` depends on
/// `upstream` and may only run once `upstream` completed successfully.
#[derive(Debug)]
pub struct TaskGraph {
    graph: DiGraph<TaskSpec, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    pub fn builder() -> TaskGraphBuilder {
        TaskGraphBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn task(&self, id: &str) -> Option<&TaskSpec> {
        self.index.get(id).map(|ix| &self.graph[*ix])
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskSpec> {
        self.graph.node_weights()
    }

    /// Direct dependencies of `id` (tasks it waits on).
    pub fn upstream_of(&self, id: &str) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of `id` (tasks waiting on it).
    pub fn downstream_of(&self, id: &str) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// All transitive dependents of `id`, excluding `id` itself.
    pub fn downstream_transitive(&self, id: &str) -> HashSet<TaskId> {
        let mut seen = HashSet::new();
        let Some(start) = self.index.get(id) else {
            return seen;
        };

        let mut stack: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(*start, Direction::Outgoing)
            .collect();

        while let Some(ix) = stack.pop() {
            if seen.insert(self.graph[ix].id.clone()) {
                stack.extend(self.graph.neighbors_directed(ix, Direction::Outgoing));
            }
        }

        seen
    }

    /// Tasks with no upstream dependency.
    pub fn roots(&self) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .filter(|ix| {
                self.graph
                    .neighbors_directed(*ix, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|ix| self.graph[ix].id.clone())
            .collect()
    }

    fn neighbors(&self, id: &str, direction: Direction) -> Vec<TaskId> {
        match self.index.get(id) {
            Some(ix) => self
                .graph
                .neighbors_directed(*ix, direction)
                .map(|n| self.graph[n].id.clone())
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Builder for [`TaskGraph`].
#[derive(Debug, Default)]
pub struct TaskGraphBuilder {
    graph: DiGraph<TaskSpec, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraphBuilder {
    pub fn add_task(&mut self, spec: TaskSpec) -> Result<&mut Self> {
        if self.index.contains_key(&spec.id) {
            return Err(EngineError::InvalidGraph(format!(
                "duplicate task id '{}'",
                spec.id
            )));
        }
        let id = spec.id.clone();
        let ix = self.graph.add_node(spec);
        self.index.insert(id, ix);
        Ok(self)
    }

    /// Record that `task` depends on `upstream`.
    pub fn add_dependency(&mut self, task: &str, upstream: &str) -> Result<&mut Self> {
        let task_ix = *self
            .index
            .get(task)
            .ok_or_else(|| EngineError::TaskNotFound(task.to_string()))?;
        let upstream_ix = *self
            .index
            .get(upstream)
            .ok_or_else(|| EngineError::TaskNotFound(upstream.to_string()))?;
        self.graph.add_edge(upstream_ix, task_ix, ());
        Ok(self)
    }

    pub fn build(self) -> TaskGraph {
        TaskGraph {
            graph: self.graph,
            index: self.index,
        }
    }
}
