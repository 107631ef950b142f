//! Orchestration: resolution, routing, coordination, context, progress.

pub mod context;
pub mod coordinator;
pub mod progress;
pub mod resolver;
pub mod router;
pub mod worker;

pub use context::{ContextSynthesizer, ProjectContext};
pub use coordinator::{Coordinator, CoordinatorHandle, RunOutcome};
pub use progress::{Health, ProgressTracker, RunSummary};
pub use resolver::CriticalPath;
pub use router::{WorkerId, WorkerProfile, WorkerRegistry, WorkerSelection};
pub use worker::{TaskDescriptor, Worker, WorkerOutcome, WorkerResult};
