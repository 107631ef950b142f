//! Task data model for the orchestration graph.
//!
//! Tasks are the atomic units of schedulable work. Each task tracks its
//! category (used for capability matching), acceptance criteria, lifecycle
//! status, assignment, produced result, and blocker history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::orchestration::worker::ArtifactRef;

/// Unique identifier for a task within a run.
///
/// Uses UUID v4 for generation. Ordered so that scheduling tie-breaks
/// (critical path, wave ordering) are deterministic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Ordinal effort estimate for a task.
///
/// A bounded size class, not a numeric promise. The weight is only used
/// to accumulate critical-path length.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    Trivial,
    Small,
    Medium,
    Large,
    XLarge,
}

impl Effort {
    /// Weight used for cumulative critical-path length.
    pub fn weight(&self) -> u32 {
        match self {
            Effort::Trivial => 1,
            Effort::Small => 2,
            Effort::Medium => 4,
            Effort::Large => 8,
            Effort::XLarge => 16,
        }
    }
}

impl Default for Effort {
    fn default() -> Self {
        Self::Medium
    }
}

impl std::fmt::Display for Effort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Effort::Trivial => "trivial",
            Effort::Small => "small",
            Effort::Medium => "medium",
            Effort::Large => "large",
            Effort::XLarge => "xlarge",
        };
        write!(f, "{}", s)
    }
}

/// Task status in its lifecycle.
///
/// ```text
/// Pending -> Ready -> InProgress -> Completed
///                   -> Blocked -> Ready            (blocker resolved)
///                   -> Failed  -> Ready            (retry, bounded count)
///                   -> Failed  (terminal, after max retries)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task created; dependencies not yet satisfied.
    Pending,
    /// All hard dependencies completed; eligible for dispatch.
    Ready,
    /// Dispatched to a worker; exactly one outstanding invocation.
    InProgress,
    /// Terminal success; all acceptance criteria satisfied.
    Completed,
    /// Worker invocation errored. Retryable until `terminal` is set.
    Failed {
        /// Error message describing the failure.
        error: String,
        /// Whether the retry budget is exhausted.
        terminal: bool,
    },
    /// A blocker was raised; not resolvable by local retry alone.
    Blocked {
        /// Reason why the task is blocked.
        reason: String,
    },
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// Check if the status is terminal (Completed or terminal Failed).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { terminal: true, .. }
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed { error, terminal } => {
                if *terminal {
                    write!(f, "failed (terminal): {}", error)
                } else {
                    write!(f, "failed: {}", error)
                }
            }
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
        }
    }
}

/// A checkable completion condition.
///
/// A task cannot be marked Completed while any criterion is unmet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    /// Human-readable condition.
    pub description: String,
    /// Whether the condition has been verified.
    pub met: bool,
}

impl AcceptanceCriterion {
    /// Create a new, unmet criterion.
    pub fn new(description: &str) -> Self {
        Self {
            description: description.to_string(),
            met: false,
        }
    }
}

/// Why a task became blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BlockerReason {
    /// The invocation exceeded its timeout. Often worker-external,
    /// so this is not treated as a task failure.
    Timeout,
    /// An external input the task needs is missing.
    MissingInput { detail: String },
    /// The worker raised a structured blocker.
    WorkerRaised { detail: String },
    /// A hard dependency failed terminally.
    UpstreamFailed { upstream: TaskId },
}

impl std::fmt::Display for BlockerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockerReason::Timeout => write!(f, "timeout"),
            BlockerReason::MissingInput { detail } => write!(f, "missing input: {}", detail),
            BlockerReason::WorkerRaised { detail } => write!(f, "worker blocked: {}", detail),
            BlockerReason::UpstreamFailed { upstream } => {
                write!(f, "upstream failed: {}", upstream.short())
            }
        }
    }
}

/// Resolution state of a blocker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ResolutionState {
    /// Still unresolved.
    Open,
    /// Resolved by reassignment, retry, or escalation.
    Resolved {
        how: String,
        at: DateTime<Utc>,
    },
}

/// Structured record of a non-retryable-by-itself obstruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockerEvent {
    /// The task that was blocked.
    pub task_id: TaskId,
    /// Why the blocker was raised.
    pub reason: BlockerReason,
    /// When the blocker was raised.
    pub raised_at: DateTime<Utc>,
    /// Current resolution state.
    pub resolution: ResolutionState,
}

impl BlockerEvent {
    /// Create a new open blocker for a task.
    pub fn new(task_id: TaskId, reason: BlockerReason) -> Self {
        Self {
            task_id,
            reason,
            raised_at: Utc::now(),
            resolution: ResolutionState::Open,
        }
    }

    /// Check if the blocker is still open.
    pub fn is_open(&self) -> bool {
        matches!(self.resolution, ResolutionState::Open)
    }

    /// Mark the blocker resolved.
    pub fn resolve(&mut self, how: &str) {
        self.resolution = ResolutionState::Resolved {
            how: how.to_string(),
            at: Utc::now(),
        };
    }
}

/// A single task in the orchestration graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Short human-readable intent.
    pub title: String,
    /// Detailed description of what the task should accomplish.
    pub description: String,
    /// Tag used for capability matching (e.g. "data-layer").
    pub category: String,
    /// Ordered list of checkable completion conditions.
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    /// Ordinal effort estimate.
    pub effort: Effort,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Capability resolved at first dispatch; immutable once assigned.
    pub assigned_capability: Option<String>,
    /// Artifact reference produced on completion.
    pub result: Option<ArtifactRef>,
    /// Ordered list of blockers raised for this task.
    pub blocker_history: Vec<BlockerEvent>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task was first dispatched.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new Pending task with the given title, description, and category.
    pub fn new(title: &str, description: &str, category: &str) -> Self {
        Self {
            id: TaskId::new(),
            title: title.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            acceptance_criteria: Vec::new(),
            effort: Effort::default(),
            status: TaskStatus::Pending,
            assigned_capability: None,
            result: None,
            blocker_history: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Builder-style effort setter.
    pub fn with_effort(mut self, effort: Effort) -> Self {
        self.effort = effort;
        self
    }

    /// Builder-style acceptance criterion.
    pub fn with_criterion(mut self, description: &str) -> Self {
        self.acceptance_criteria
            .push(AcceptanceCriterion::new(description));
        self
    }

    /// Mark the task Ready (hard dependencies satisfied).
    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    /// Start the task: transition to InProgress and pin the capability.
    ///
    /// The assigned capability is set only on the first dispatch and never
    /// changes afterwards.
    pub fn start(&mut self, capability: &str) {
        self.status = TaskStatus::InProgress;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if self.assigned_capability.is_none() {
            self.assigned_capability = Some(capability.to_string());
        }
    }

    /// Mark the task Completed with its produced artifact.
    ///
    /// All acceptance criteria are marked met; the coordinator only calls
    /// this after verifying them.
    pub fn complete(&mut self, artifact: ArtifactRef) {
        for criterion in &mut self.acceptance_criteria {
            criterion.met = true;
        }
        self.status = TaskStatus::Completed;
        self.result = Some(artifact);
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task failed. Terminal failures also set the completion time.
    pub fn fail(&mut self, error: &str, terminal: bool) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
            terminal,
        };
        if terminal {
            self.completed_at = Some(Utc::now());
        }
    }

    /// Block the task, recording the blocker in its history.
    pub fn block(&mut self, reason: BlockerReason) {
        self.status = TaskStatus::Blocked {
            reason: reason.to_string(),
        };
        self.blocker_history
            .push(BlockerEvent::new(self.id, reason));
    }

    /// Resolve the most recent open blocker, if any. Returns true if one was resolved.
    pub fn resolve_blocker(&mut self, how: &str) -> bool {
        if let Some(blocker) = self.blocker_history.iter_mut().rev().find(|b| b.is_open()) {
            blocker.resolve(how);
            true
        } else {
            false
        }
    }

    /// Number of still-open blockers for this task.
    pub fn open_blockers(&self) -> usize {
        self.blocker_history.iter().filter(|b| b.is_open()).count()
    }

    /// Check if the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if every acceptance criterion is met.
    pub fn criteria_satisfied(&self) -> bool {
        self.acceptance_criteria.iter().all(|c| c.met)
    }
}
