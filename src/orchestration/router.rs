//! Delegation router: capability-ranked worker selection.
//!
//! A ranked capability registry rather than a fixed name table: workers
//! declare primary and backup capabilities with a priority within each
//! tag. Routing is pure: the same registry and category always produce
//! the same selection, which keeps scheduling deterministic.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::orchestration::worker::Worker;

/// Stable identifier for a registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One capability listing with its priority rank (lower is preferred).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRank {
    pub capability: String,
    pub priority: u32,
}

impl CapabilityRank {
    pub fn new(capability: &str, priority: u32) -> Self {
        Self {
            capability: capability.to_string(),
            priority,
        }
    }
}

/// Declared capabilities of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProfile {
    pub worker_id: WorkerId,
    /// Capabilities this worker specializes in.
    pub primary: Vec<CapabilityRank>,
    /// Capabilities this worker can cover as backup.
    pub backup: Vec<CapabilityRank>,
}

impl WorkerProfile {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            primary: Vec::new(),
            backup: Vec::new(),
        }
    }

    pub fn with_primary(mut self, capability: &str, priority: u32) -> Self {
        self.primary.push(CapabilityRank::new(capability, priority));
        self
    }

    pub fn with_backup(mut self, capability: &str, priority: u32) -> Self {
        self.backup.push(CapabilityRank::new(capability, priority));
        self
    }

    fn priority_for(&self, category: &str, backup: bool) -> Option<u32> {
        let list = if backup { &self.backup } else { &self.primary };
        list.iter()
            .filter(|r| r.capability == category)
            .map(|r| r.priority)
            .min()
    }
}

/// The outcome of routing one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSelection {
    /// The selected worker.
    pub worker_id: WorkerId,
    /// The capability the selection was made on.
    pub capability: String,
    /// True if the worker only lists the capability as backup.
    pub via_backup: bool,
}

/// Registry of worker profiles and their executors.
pub struct WorkerRegistry {
    profiles: Vec<WorkerProfile>,
    executors: HashMap<WorkerId, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            profiles: Vec::new(),
            executors: HashMap::new(),
        }
    }

    /// Register a worker with its profile.
    pub fn register(&mut self, profile: WorkerProfile, executor: Arc<dyn Worker>) {
        self.executors.insert(profile.worker_id.clone(), executor);
        self.profiles.push(profile);
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// The executor for a previously routed selection.
    pub fn executor(&self, id: &WorkerId) -> Option<Arc<dyn Worker>> {
        self.executors.get(id).cloned()
    }

    /// Route a category to a worker.
    ///
    /// Selection order: primary listings ranked by priority (ties broken
    /// by worker id), then backup listings the same way. A category no
    /// profile covers yields `NoCapableWorker`.
    pub fn route(&self, category: &str) -> Result<WorkerSelection> {
        for backup in [false, true] {
            let mut candidates: Vec<(u32, &WorkerId)> = self
                .profiles
                .iter()
                .filter_map(|p| {
                    p.priority_for(category, backup)
                        .map(|priority| (priority, &p.worker_id))
                })
                .collect();
            candidates.sort();
            if let Some((_, worker_id)) = candidates.first() {
                return Ok(WorkerSelection {
                    worker_id: (*worker_id).clone(),
                    capability: category.to_string(),
                    via_backup: backup,
                });
            }
        }
        Err(Error::NoCapableWorker {
            category: category.to_string(),
        })
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("workers", &self.profiles.len())
            .finish()
    }
}
