//! Dependency resolution: readiness, waves, and the critical path.
//!
//! Pure functions over a graph snapshot. The coordinator always calls
//! them against a graph that reflects every absorbed result so far; no
//! component ever reads a partially-updated graph.

use petgraph::algo::toposort;
use petgraph::graph::NodeIndex;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::graph::{DependencyKind, TaskGraph};
use crate::core::task::{TaskId, TaskStatus};
use crate::error::{Error, Result};

/// The longest hard-dependency chain by cumulative estimated effort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalPath {
    /// Task ids along the path, dependency-first.
    pub tasks: Vec<TaskId>,
    /// Cumulative effort weight of the path.
    pub total_weight: u32,
}

/// Tasks eligible for dispatch: status Pending and every hard dependency
/// Completed. Soft dependencies never gate readiness.
///
/// Sorted by task id for deterministic dispatch order.
pub fn ready_set(graph: &TaskGraph) -> Vec<TaskId> {
    let mut ready: Vec<TaskId> = graph
        .tasks()
        .filter(|task| task.status == TaskStatus::Pending)
        .filter(|task| {
            graph
                .dependencies(&task.id)
                .iter()
                .all(|(dep, kind)| *kind != DependencyKind::Hard || dep.status == TaskStatus::Completed)
        })
        .map(|task| task.id)
        .collect();
    ready.sort();
    ready
}

/// Partition the graph into ordered waves of mutually independent tasks.
///
/// Kahn's topological sort, grouped by peel iteration instead of
/// flattened: wave N contains the tasks whose every dependency sits in an
/// earlier wave, so no wave contains an edge in either direction and the
/// concatenation is a valid topological order. Ids within a wave are
/// sorted for reproducibility.
pub fn waves(graph: &TaskGraph) -> Result<Vec<Vec<TaskId>>> {
    let inner = graph.inner();
    let mut indegree: HashMap<NodeIndex, usize> = inner
        .node_indices()
        .map(|n| (n, inner.neighbors_directed(n, Direction::Incoming).count()))
        .collect();

    let mut frontier: Vec<NodeIndex> = indegree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&n, _)| n)
        .collect();

    let mut peeled = 0usize;
    let mut result = Vec::new();
    while !frontier.is_empty() {
        let mut wave: Vec<TaskId> = frontier.iter().map(|&n| inner[n].id).collect();
        wave.sort();
        peeled += wave.len();

        let mut next = Vec::new();
        for &node in &frontier {
            for succ in inner.neighbors_directed(node, Direction::Outgoing) {
                let d = indegree.get_mut(&succ).expect("successor is in the graph");
                *d -= 1;
                if *d == 0 {
                    next.push(succ);
                }
            }
        }
        result.push(wave);
        frontier = next;
    }

    if peeled != graph.task_count() {
        return Err(Error::Validation(
            "graph contains a cycle; cannot compute waves".to_string(),
        ));
    }
    Ok(result)
}

/// Compute the critical path: the longest chain of hard-dependent tasks
/// by cumulative effort weight.
///
/// Single topological pass, O(V+E). Ties are broken by task id ordering
/// so results are reproducible.
pub fn critical_path(graph: &TaskGraph) -> Result<CriticalPath> {
    let inner = graph.inner();
    if inner.node_count() == 0 {
        return Ok(CriticalPath {
            tasks: Vec::new(),
            total_weight: 0,
        });
    }

    let order = toposort(inner, None).map_err(|_| {
        Error::Validation("graph contains a cycle; cannot compute critical path".to_string())
    })?;

    // dist[n] = best cumulative weight of a hard chain ending at n
    let mut dist: HashMap<NodeIndex, u32> = HashMap::new();
    let mut pred: HashMap<NodeIndex, NodeIndex> = HashMap::new();

    for &node in &order {
        let own = inner[node].effort.weight();
        let mut best: Option<(u32, NodeIndex)> = None;
        for edge in inner.edges_directed(node, Direction::Incoming) {
            if *petgraph::visit::EdgeRef::weight(&edge) != DependencyKind::Hard {
                continue;
            }
            let p = petgraph::visit::EdgeRef::source(&edge);
            let candidate = dist[&p];
            let better = match best {
                None => true,
                Some((w, prev)) => {
                    candidate > w || (candidate == w && inner[p].id < inner[prev].id)
                }
            };
            if better {
                best = Some((candidate, p));
            }
        }
        match best {
            Some((w, p)) => {
                dist.insert(node, own + w);
                pred.insert(node, p);
            }
            None => {
                dist.insert(node, own);
            }
        }
    }

    // Endpoint with the largest distance; ties by smaller task id
    let end = inner
        .node_indices()
        .max_by(|&a, &b| {
            dist[&a]
                .cmp(&dist[&b])
                .then_with(|| inner[b].id.cmp(&inner[a].id))
        })
        .expect("graph is non-empty");

    let mut path = vec![end];
    let mut cursor = end;
    while let Some(&p) = pred.get(&cursor) {
        path.push(p);
        cursor = p;
    }
    path.reverse();

    Ok(CriticalPath {
        tasks: path.into_iter().map(|n| inner[n].id).collect(),
        total_weight: dist[&end],
    })
}
