//! conductor: a task orchestration engine.
//!
//! Decomposes a goal into a dependency graph of tasks, routes each task to
//! a capability-matched worker, runs independent tasks concurrently under
//! per-capability budgets, and folds results into a single shared project
//! context. One event loop owns all state; workers communicate solely
//! through descriptors and outcome channels.

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod state;

pub use crate::config::{RunConfig, SoftInputPolicy};
pub use crate::core::graph::{DependencyKind, TaskGraph};
pub use crate::core::task::{BlockerReason, Effort, Task, TaskId, TaskStatus};
pub use crate::error::{Error, Result};
pub use crate::orchestration::context::{ContextSynthesizer, ProjectContext};
pub use crate::orchestration::coordinator::{Coordinator, CoordinatorHandle, RunOutcome};
pub use crate::orchestration::progress::{Health, ProgressTracker, RunSummary};
pub use crate::orchestration::resolver::{critical_path, ready_set, waves, CriticalPath};
pub use crate::orchestration::router::{WorkerId, WorkerProfile, WorkerRegistry};
pub use crate::orchestration::worker::{
    ArtifactRef, Decision, DependencyInput, TaskDescriptor, Worker, WorkerOutcome, WorkerResult,
};
pub use crate::state::store::RunState;
