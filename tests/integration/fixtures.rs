//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Scripted workers (succeed, fail, block, sleep, decide)
//! - Predefined task graphs
//! - A fast-running configuration

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use conductor::{
    ArtifactRef, Decision, DependencyKind, Effort, RunConfig, Task, TaskDescriptor, TaskGraph,
    TaskId, Worker, WorkerId, WorkerOutcome, WorkerProfile, WorkerRegistry, WorkerResult,
};

/// A task with one acceptance criterion and a default effort.
pub fn test_task(title: &str, category: &str) -> Task {
    Task::new(
        title,
        &format!("{} description", title),
        category,
    )
    .with_effort(Effort::Small)
    .with_criterion("output produced")
}

/// a -> b -> d and a -> c -> d, all hard edges, one category.
pub fn diamond_graph(category: &str) -> (TaskGraph, Vec<TaskId>) {
    let mut graph = TaskGraph::new();
    let tasks: Vec<Task> = ["a", "b", "c", "d"]
        .iter()
        .map(|t| test_task(t, category))
        .collect();
    let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
    for task in tasks {
        graph.add_task(task);
    }
    graph.add_edge(&ids[0], &ids[1], DependencyKind::Hard).unwrap();
    graph.add_edge(&ids[0], &ids[2], DependencyKind::Hard).unwrap();
    graph.add_edge(&ids[1], &ids[3], DependencyKind::Hard).unwrap();
    graph.add_edge(&ids[2], &ids[3], DependencyKind::Hard).unwrap();
    (graph, ids)
}

/// N independent tasks in one category.
pub fn independent_tasks(n: usize, category: &str) -> (TaskGraph, Vec<TaskId>) {
    let mut graph = TaskGraph::new();
    let mut ids = Vec::new();
    for i in 0..n {
        let task = test_task(&format!("task-{}", i), category);
        ids.push(task.id);
        graph.add_task(task);
    }
    (graph, ids)
}

/// A config with millisecond-scale delays so tests finish quickly.
pub fn fast_config() -> RunConfig {
    RunConfig {
        retry_base_delay: Duration::from_millis(1),
        invocation_timeout: Duration::from_secs(5),
        grace_timeout: Duration::from_millis(100),
        ..Default::default()
    }
}

/// Completes every task immediately, meeting all criteria.
pub struct SucceedingWorker;

impl Worker for SucceedingWorker {
    fn invoke(&self, descriptor: TaskDescriptor) -> BoxFuture<'static, WorkerOutcome> {
        Box::pin(async move {
            WorkerOutcome::Completed(WorkerResult::artifact_only(
                ArtifactRef::new(format!("artifact://{}", descriptor.id.short())),
                descriptor.acceptance_criteria.len(),
            ))
        })
    }
}

/// Fails every invocation.
pub struct FailingWorker;

impl Worker for FailingWorker {
    fn invoke(&self, _descriptor: TaskDescriptor) -> BoxFuture<'static, WorkerOutcome> {
        Box::pin(async move {
            WorkerOutcome::Failed {
                error: "scripted failure".to_string(),
            }
        })
    }
}

/// Raises a structured blocker on every invocation.
pub struct BlockingWorker;

impl Worker for BlockingWorker {
    fn invoke(&self, _descriptor: TaskDescriptor) -> BoxFuture<'static, WorkerOutcome> {
        Box::pin(async move {
            WorkerOutcome::Blocked {
                reason: "missing credentials".to_string(),
            }
        })
    }
}

/// Sleeps before completing; counts concurrent invocations.
pub struct SlowWorker {
    pub sleep: Duration,
    pub active: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

impl SlowWorker {
    pub fn new(sleep: Duration) -> (Self, Arc<AtomicUsize>) {
        let peak = Arc::new(AtomicUsize::new(0));
        (
            Self {
                sleep,
                active: Arc::new(AtomicUsize::new(0)),
                peak: Arc::clone(&peak),
            },
            peak,
        )
    }
}

impl Worker for SlowWorker {
    fn invoke(&self, descriptor: TaskDescriptor) -> BoxFuture<'static, WorkerOutcome> {
        let sleep = self.sleep;
        let active = Arc::clone(&self.active);
        let peak = Arc::clone(&self.peak);
        Box::pin(async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(sleep).await;
            active.fetch_sub(1, Ordering::SeqCst);
            WorkerOutcome::Completed(WorkerResult::artifact_only(
                ArtifactRef::new(format!("artifact://{}", descriptor.id.short())),
                descriptor.acceptance_criteria.len(),
            ))
        })
    }
}

/// Completes with a scripted decision attached to the result.
pub struct DecidingWorker {
    pub subject: String,
    pub choice: String,
}

impl Worker for DecidingWorker {
    fn invoke(&self, descriptor: TaskDescriptor) -> BoxFuture<'static, WorkerOutcome> {
        let subject = self.subject.clone();
        let choice = self.choice.clone();
        Box::pin(async move {
            WorkerOutcome::Completed(WorkerResult {
                artifact: ArtifactRef::new(format!("artifact://{}", descriptor.id.short())),
                decisions: vec![Decision::new(&subject, &choice, "scripted")],
                criteria_met: vec![true; descriptor.acceptance_criteria.len()],
            })
        })
    }
}

/// Fails the first `failures` invocations across all tasks, then succeeds.
pub struct FlakyWorker {
    pub failures: usize,
    pub calls: AtomicUsize,
}

impl FlakyWorker {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Worker for FlakyWorker {
    fn invoke(&self, descriptor: TaskDescriptor) -> BoxFuture<'static, WorkerOutcome> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let failures = self.failures;
        Box::pin(async move {
            if call < failures {
                WorkerOutcome::Failed {
                    error: "flaky".to_string(),
                }
            } else {
                WorkerOutcome::Completed(WorkerResult::artifact_only(
                    ArtifactRef::new(format!("artifact://{}", descriptor.id.short())),
                    descriptor.acceptance_criteria.len(),
                ))
            }
        })
    }
}

/// A registry with one worker covering one category.
pub fn single_worker_registry(category: &str, worker: Arc<dyn Worker>) -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    registry.register(
        WorkerProfile::new(WorkerId::new(format!("{}-worker", category)))
            .with_primary(category, 1),
        worker,
    );
    registry
}
