//! Run persistence.
//!
//! A `RunState` is the full serializable picture of a run: every task with
//! its status, every dependency edge, and the project context. Restoring
//! it rebuilds a graph whose ready set matches the one at capture time, so
//! a run can pick up where it stopped.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::clog_debug;
use crate::core::graph::{DependencyKind, TaskGraph};
use crate::core::task::{Task, TaskId};
use crate::error::Result;
use crate::orchestration::context::ProjectContext;

/// Serializable snapshot of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// All tasks with their current statuses and histories.
    pub tasks: Vec<Task>,
    /// Dependency edges as (from, to, kind) triples.
    pub edges: Vec<(TaskId, TaskId, DependencyKind)>,
    /// The accumulated project context.
    pub context: ProjectContext,
}

impl RunState {
    /// Capture the current state of a run.
    pub fn capture(graph: &TaskGraph, context: &ProjectContext) -> Self {
        let mut tasks: Vec<Task> = graph.tasks().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        let mut edges = graph.edges();
        edges.sort();
        Self {
            tasks,
            edges,
            context: context.clone(),
        }
    }

    /// Rebuild the graph and context from a snapshot.
    ///
    /// Edges go through the same cycle-checked insertion as live
    /// construction, so a corrupted snapshot cannot smuggle in a cycle.
    pub fn restore(&self) -> Result<(TaskGraph, ProjectContext)> {
        let mut graph = TaskGraph::new();
        for task in &self.tasks {
            graph.add_task(task.clone());
        }
        for (from, to, kind) in &self.edges {
            graph.add_edge(from, to, *kind)?;
        }
        Ok((graph, self.context.clone()))
    }

    /// Write the snapshot as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        clog_debug!("Run state saved to {}", path.display());
        Ok(())
    }

    /// Load a snapshot from disk.
    pub fn load(path: &Path) -> Result<Self> {
        clog_debug!("Loading run state from {}", path.display());
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}
