//! Progress tracking and run health classification.
//!
//! The tracker derives everything from the graph and context; it keeps no
//! state of its own beyond the configured thresholds, so a summary is
//! always consistent with the data it was computed from.

use petgraph::algo::toposort;
use petgraph::graph::NodeIndex;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::config::{HealthThresholds, RunConfig};
use crate::core::graph::{DependencyKind, TaskGraph};
use crate::core::task::{TaskId, TaskStatus};
use crate::orchestration::context::ProjectContext;

/// Overall health of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    /// No failures, no open blockers, on schedule.
    Healthy,
    /// Degraded but recoverable: retryable trouble, open blockers below
    /// the critical threshold, unresolved conflicts, or behind schedule.
    Warning,
    /// A critical task failed terminally or blockers piled past the
    /// critical threshold.
    Critical,
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Health::Healthy => write!(f, "healthy"),
            Health::Warning => write!(f, "warning"),
            Health::Critical => write!(f, "critical"),
        }
    }
}

/// Status counts over the whole graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub blocked: usize,
    pub failed_retryable: usize,
    pub failed_terminal: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending
            + self.ready
            + self.in_progress
            + self.completed
            + self.blocked
            + self.failed_retryable
            + self.failed_terminal
    }
}

/// Completion within one phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub completed: usize,
    pub total: usize,
}

/// Point-in-time report of a run, emitted on every status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Counts per lifecycle status.
    pub counts: StatusCounts,
    /// Completion per phase: the partition declared in `RunConfig::phases`,
    /// with tasks outside every declared phase grouped by category.
    pub phases: BTreeMap<String, PhaseProgress>,
    /// Blockers with no resolution yet, across all tasks.
    pub open_blockers: usize,
    /// Tasks that failed with no retries left.
    pub terminal_failures: Vec<TaskId>,
    /// Equal-authority conflicts no operator has settled.
    pub unresolved_conflicts: usize,
    /// Cumulative effort weight of the longest unfinished hard chain.
    pub remaining_path_weight: u32,
    /// True when the remaining path weight exceeds the configured budget.
    pub behind_schedule: bool,
    /// Derived health classification.
    pub health: Health,
}

impl RunSummary {
    /// Check if every task has reached a terminal state.
    pub fn all_settled(&self) -> bool {
        self.counts.completed + self.counts.failed_terminal == self.counts.total()
    }
}

/// Computes run summaries against configured thresholds.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    thresholds: HealthThresholds,
    critical_task_ids: HashSet<TaskId>,
    critical_path_budget: Option<u32>,
    /// Inverted `RunConfig::phases`: which declared phase each task is in.
    phase_of: HashMap<TaskId, String>,
}

impl ProgressTracker {
    pub fn new(config: &RunConfig) -> Self {
        let mut phase_of = HashMap::new();
        for (name, ids) in &config.phases {
            for id in ids {
                phase_of.insert(*id, name.clone());
            }
        }
        Self {
            thresholds: config.health_thresholds.clone(),
            critical_task_ids: config.critical_task_ids.clone(),
            critical_path_budget: config.critical_path_budget,
            phase_of,
        }
    }

    /// Summarize the current state of a run.
    pub fn summarize(&self, graph: &TaskGraph, context: &ProjectContext) -> RunSummary {
        let mut counts = StatusCounts::default();
        let mut phases: BTreeMap<String, PhaseProgress> = BTreeMap::new();
        let mut open_blockers = 0;
        let mut terminal_failures = Vec::new();

        for task in graph.tasks() {
            let phase_name = self
                .phase_of
                .get(&task.id)
                .cloned()
                .unwrap_or_else(|| task.category.clone());
            let phase = phases.entry(phase_name).or_default();
            phase.total += 1;
            open_blockers += task.open_blockers();

            match &task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => {
                    counts.completed += 1;
                    phase.completed += 1;
                }
                TaskStatus::Blocked { .. } => counts.blocked += 1,
                TaskStatus::Failed { terminal, .. } => {
                    if *terminal {
                        counts.failed_terminal += 1;
                        terminal_failures.push(task.id);
                    } else {
                        counts.failed_retryable += 1;
                    }
                }
            }
        }
        terminal_failures.sort();

        let remaining_path_weight = remaining_hard_path_weight(graph);
        let behind_schedule = self
            .critical_path_budget
            .is_some_and(|budget| remaining_path_weight > budget);
        let unresolved_conflicts = context.unresolved_conflicts();

        let health = self.classify(
            &terminal_failures,
            open_blockers,
            unresolved_conflicts,
            behind_schedule,
        );

        RunSummary {
            counts,
            phases,
            open_blockers,
            terminal_failures,
            unresolved_conflicts,
            remaining_path_weight,
            behind_schedule,
            health,
        }
    }

    fn classify(
        &self,
        terminal_failures: &[TaskId],
        open_blockers: usize,
        unresolved_conflicts: usize,
        behind_schedule: bool,
    ) -> Health {
        let critical_task_failed = terminal_failures
            .iter()
            .any(|id| self.critical_task_ids.contains(id));
        if critical_task_failed || open_blockers >= self.thresholds.critical_blockers {
            return Health::Critical;
        }
        if !terminal_failures.is_empty()
            || open_blockers >= self.thresholds.warning_blockers
            || unresolved_conflicts > 0
            || behind_schedule
        {
            return Health::Warning;
        }
        Health::Healthy
    }
}

/// Longest hard-dependency chain by cumulative effort, counting only
/// tasks that have not completed. This is the work still standing between
/// now and the end of the run.
fn remaining_hard_path_weight(graph: &TaskGraph) -> u32 {
    let inner = graph.inner();
    let Ok(order) = toposort(inner, None) else {
        return 0;
    };

    let mut dist: HashMap<NodeIndex, u32> = HashMap::new();
    let mut best = 0;
    for &node in &order {
        let own = if inner[node].status == TaskStatus::Completed {
            0
        } else {
            inner[node].effort.weight()
        };
        let upstream = inner
            .edges_directed(node, Direction::Incoming)
            .filter(|e| *petgraph::visit::EdgeRef::weight(e) == DependencyKind::Hard)
            .map(|e| dist[&petgraph::visit::EdgeRef::source(&e)])
            .max()
            .unwrap_or(0);
        let total = own + upstream;
        dist.insert(node, total);
        best = best.max(total);
    }
    best
}
