//! Task dependency graph.
//!
//! The TaskGraph is the single source of truth for structure: tasks as
//! nodes, dependency edges with a hard/soft kind. No other component keeps
//! a divergent copy; they query it.

use petgraph::algo::{has_path_connecting, is_cyclic_directed};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};

/// Kind of dependency between two tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Dependent cannot start until the dependency is Completed.
    Hard,
    /// Dependent may start on stub inputs, but cannot itself complete
    /// until the dependency does.
    Soft,
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyKind::Hard => write!(f, "hard"),
            DependencyKind::Soft => write!(f, "soft"),
        }
    }
}

/// The task dependency graph.
///
/// An edge `from -> to` means `to` depends on `from`. The `blocks`
/// relation is always derived from edges, never authored directly.
pub struct TaskGraph {
    /// The underlying directed graph.
    graph: DiGraph<Task, DependencyKind>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Add a task. If the task already exists (same id), the existing
    /// node is kept and returned.
    pub fn add_task(&mut self, task: Task) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }
        let id = task.id;
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Add a dependency edge: `to` depends on `from`.
    ///
    /// Rejected with `Error::Cycle` if the edge would create a cycle,
    /// leaving the graph unchanged. Cycle detection is an incremental
    /// reachability check (is `from` reachable from `to`?), not a full
    /// re-scan.
    pub fn add_edge(&mut self, from: &TaskId, to: &TaskId, kind: DependencyKind) -> Result<()> {
        let from_index = self.index_of(from)?;
        let to_index = self.index_of(to)?;

        if from_index == to_index || has_path_connecting(&self.graph, to_index, from_index, None) {
            return Err(Error::Cycle {
                from: *from,
                to: *to,
            });
        }

        self.graph.add_edge(from_index, to_index, kind);
        Ok(())
    }

    /// Remove a task, cascading removal of all its edges.
    pub fn remove_task(&mut self, id: &TaskId) -> Result<Task> {
        let index = self.index_of(id)?;
        self.task_index.remove(id);

        // remove_node swaps the last node into the freed index
        let removed = self
            .graph
            .remove_node(index)
            .ok_or(Error::TaskNotFound(*id))?;
        if let Some(moved) = self.graph.node_weight(index) {
            self.task_index.insert(moved.id, index);
        }
        Ok(removed)
    }

    /// Get a reference to a task by its id.
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get a mutable reference to a task by its id.
    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        if let Some(&index) = self.task_index.get(id) {
            self.graph.node_weight_mut(index)
        } else {
            None
        }
    }

    /// Check if the graph contains a task.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Number of tasks.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of dependency edges.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Check if the graph is acyclic. Holds by construction; exposed for
    /// verification after bulk loads.
    pub fn is_acyclic(&self) -> bool {
        !is_cyclic_directed(&self.graph)
    }

    /// The dependency kind between two tasks, if an edge exists.
    pub fn edge_kind(&self, from: &TaskId, to: &TaskId) -> Option<DependencyKind> {
        let from_idx = self.task_index.get(from)?;
        let to_idx = self.task_index.get(to)?;
        let edge = self.graph.find_edge(*from_idx, *to_idx)?;
        self.graph.edge_weight(edge).copied()
    }

    /// Tasks the given task depends on, with the edge kind.
    pub fn dependencies(&self, id: &TaskId) -> Vec<(&Task, DependencyKind)> {
        self.neighbors_with_kind(id, Direction::Incoming)
    }

    /// Tasks that depend on the given task, with the edge kind.
    ///
    /// This is the derived `blocks` relation.
    pub fn dependents(&self, id: &TaskId) -> Vec<(&Task, DependencyKind)> {
        self.neighbors_with_kind(id, Direction::Outgoing)
    }

    /// Ids of hard dependencies of the given task.
    pub fn hard_dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.dependencies(id)
            .into_iter()
            .filter(|(_, kind)| *kind == DependencyKind::Hard)
            .map(|(task, _)| task.id)
            .collect()
    }

    /// Ids of soft dependencies of the given task.
    pub fn soft_dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.dependencies(id)
            .into_iter()
            .filter(|(_, kind)| *kind == DependencyKind::Soft)
            .map(|(task, _)| task.id)
            .collect()
    }

    /// Ids of tasks hard-dependent on the given task.
    pub fn hard_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.dependents(id)
            .into_iter()
            .filter(|(_, kind)| *kind == DependencyKind::Hard)
            .map(|(task, _)| task.id)
            .collect()
    }

    /// All tasks, in arbitrary order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// All task ids, sorted for deterministic iteration.
    pub fn task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.task_index.keys().copied().collect();
        ids.sort();
        ids
    }

    /// All edges as (from, to, kind) triples. Used for persistence.
    pub fn edges(&self) -> Vec<(TaskId, TaskId, DependencyKind)> {
        self.graph
            .edge_indices()
            .filter_map(|e| {
                let (a, b) = self.graph.edge_endpoints(e)?;
                let kind = *self.graph.edge_weight(e)?;
                Some((self.graph[a].id, self.graph[b].id, kind))
            })
            .collect()
    }

    /// Access the underlying graph for traversal algorithms.
    pub(crate) fn inner(&self) -> &DiGraph<Task, DependencyKind> {
        &self.graph
    }

    /// NodeIndex for a task id.
    pub(crate) fn index_of(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or(Error::TaskNotFound(*id))
    }

    fn neighbors_with_kind(&self, id: &TaskId, dir: Direction) -> Vec<(&Task, DependencyKind)> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(index, dir)
            .filter_map(|edge| {
                let other = if dir == Direction::Incoming {
                    petgraph::visit::EdgeRef::source(&edge)
                } else {
                    petgraph::visit::EdgeRef::target(&edge)
                };
                self.graph
                    .node_weight(other)
                    .map(|task| (task, *petgraph::visit::EdgeRef::weight(&edge)))
            })
            .collect()
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}
