//! Worker invocation boundary.
//!
//! Workers are external executors identified by capability tags. The engine
//! hands a worker a `TaskDescriptor` and gets back a completed result, a
//! structured blocker, or an error. Workers are stateless from the engine's
//! perspective: each invocation is independent, and the engine never assumes
//! a worker remembers prior calls.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::core::task::TaskId;

/// Reference to an artifact produced by a worker.
///
/// Opaque to the engine; only the registry cares about its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(pub String);

impl ArtifactRef {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decision recorded by a worker while producing its result.
///
/// Carries its own timestamp so that replaying the same results into a
/// fresh context reproduces an identical decision log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// What the decision is about (conflict key).
    pub subject: String,
    /// The chosen option.
    pub choice: String,
    /// Why it was chosen.
    pub rationale: String,
    /// When the decision was made.
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    pub fn new(subject: &str, choice: &str, rationale: &str) -> Self {
        Self {
            subject: subject.to_string(),
            choice: choice.to_string(),
            rationale: rationale.to_string(),
            decided_at: Utc::now(),
        }
    }
}

/// Input handed to a worker for one dependency of its task.
///
/// Soft dependencies that have not completed yet arrive as stubs; the
/// worker must treat stub content as placeholder, not real output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DependencyInput {
    /// The dependency completed; this is its real artifact.
    Artifact {
        task_id: TaskId,
        artifact: ArtifactRef,
    },
    /// The (soft) dependency has not completed; placeholder input.
    Stub {
        task_id: TaskId,
        placeholder: String,
    },
}

impl DependencyInput {
    /// Check if this input is a placeholder.
    pub fn is_stub(&self) -> bool {
        matches!(self, DependencyInput::Stub { .. })
    }

    /// The task this input came from.
    pub fn source(&self) -> TaskId {
        match self {
            DependencyInput::Artifact { task_id, .. } => *task_id,
            DependencyInput::Stub { task_id, .. } => *task_id,
        }
    }
}

/// Everything a worker needs to execute one task.
///
/// This is the only contract workers must satisfy; they need not know
/// about the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// The task being executed.
    pub id: TaskId,
    /// Capability tag the task was routed on.
    pub category: String,
    /// Short human-readable intent.
    pub title: String,
    /// Detailed description of the work.
    pub description: String,
    /// Conditions the result must satisfy, in order.
    pub acceptance_criteria: Vec<String>,
    /// Inputs from dependencies (real artifacts or soft-dependency stubs).
    pub inputs: Vec<DependencyInput>,
}

impl TaskDescriptor {
    /// Check if any input is still a stub.
    pub fn has_stub_inputs(&self) -> bool {
        self.inputs.iter().any(|i| i.is_stub())
    }
}

/// The successful payload of a worker invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResult {
    /// Reference to the produced artifact.
    pub artifact: ArtifactRef,
    /// Decisions made while producing the artifact.
    pub decisions: Vec<Decision>,
    /// Parallel to the descriptor's acceptance criteria: whether each
    /// condition was verified.
    pub criteria_met: Vec<bool>,
}

impl WorkerResult {
    /// A result with all criteria met and no decisions.
    pub fn artifact_only(artifact: ArtifactRef, criteria_count: usize) -> Self {
        Self {
            artifact,
            decisions: Vec::new(),
            criteria_met: vec![true; criteria_count],
        }
    }

    /// Check that every criterion was verified.
    pub fn all_criteria_met(&self, expected: usize) -> bool {
        self.criteria_met.len() == expected && self.criteria_met.iter().all(|m| *m)
    }
}

/// Outcome of one worker invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum WorkerOutcome {
    /// The task was completed.
    Completed(WorkerResult),
    /// The worker hit an obstruction it cannot retry through.
    Blocked { reason: String },
    /// The invocation errored; eligible for bounded retry.
    Failed { error: String },
}

/// An executor the engine can dispatch tasks to.
///
/// `invoke` returns a boxed future so registries can hold workers as
/// trait objects. Implementations must be idempotent-safe: the engine may
/// re-invoke the same task after a failure or timeout.
pub trait Worker: Send + Sync {
    fn invoke(&self, descriptor: TaskDescriptor) -> BoxFuture<'static, WorkerOutcome>;
}
