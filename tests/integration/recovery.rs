//! Recovery tests: retries, blocker resolution, cancellation, and
//! checkpoint/resume.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conductor::{
    ready_set, BlockerReason, Coordinator, DependencyKind, RunConfig, RunState, SoftInputPolicy,
    TaskGraph, TaskStatus, WorkerId, WorkerProfile, WorkerRegistry,
};

use crate::fixtures::{
    fast_config, single_worker_registry, test_task, BlockingWorker, FlakyWorker, SlowWorker,
    SucceedingWorker,
};

/// Test: Bounded Retry
/// Given a worker that fails twice then succeeds, and max_retries 3
/// When the run executes
/// Then the task completes after exactly three invocations
#[tokio::test]
async fn test_flaky_task_retries_to_success() {
    let mut graph = TaskGraph::new();
    let a = test_task("a", "qa");
    let id_a = a.id;
    graph.add_task(a);

    let worker = Arc::new(FlakyWorker::new(2));
    let calls = Arc::clone(&worker);
    let registry = single_worker_registry("qa", worker);

    let (coordinator, handle, _status) =
        Coordinator::new(graph, fast_config(), registry).unwrap();
    drop(handle);

    let outcome = coordinator.run().await.unwrap();
    assert_eq!(outcome.graph.get(&id_a).unwrap().status, TaskStatus::Completed);
    assert_eq!(calls.calls.load(Ordering::SeqCst), 3);
}

/// Test: Retry Budget Exhaustion
/// Given a worker that needs more retries than the budget allows
/// When the run executes
/// Then the task fails terminally after max_retries + 1 invocations
#[tokio::test]
async fn test_retry_budget_exhaustion() {
    let mut graph = TaskGraph::new();
    let a = test_task("a", "qa");
    let id_a = a.id;
    graph.add_task(a);

    let worker = Arc::new(FlakyWorker::new(10));
    let calls = Arc::clone(&worker);
    let registry = single_worker_registry("qa", worker);
    let config = RunConfig {
        max_retries: 2,
        ..fast_config()
    };

    let (coordinator, handle, _status) = Coordinator::new(graph, config, registry).unwrap();
    drop(handle);

    let outcome = coordinator.run().await.unwrap();
    assert!(matches!(
        outcome.graph.get(&id_a).unwrap().status,
        TaskStatus::Failed { terminal: true, .. }
    ));
    assert_eq!(calls.calls.load(Ordering::SeqCst), 3);
}

/// Test: Worker-Raised Blocker
/// Given a worker that raises a structured blocker
/// When the operator resolves it and the worker recovers
/// Then the task returns to Ready and completes, history intact
#[tokio::test]
async fn test_blocker_resolution_resumes_task() {
    let mut graph = TaskGraph::new();
    let a = test_task("a", "qa");
    let id_a = a.id;
    graph.add_task(a);

    // Blocks on the first call, succeeds afterwards
    struct BlockOnce {
        calls: std::sync::atomic::AtomicUsize,
    }
    impl conductor::Worker for BlockOnce {
        fn invoke(
            &self,
            descriptor: conductor::TaskDescriptor,
        ) -> futures::future::BoxFuture<'static, conductor::WorkerOutcome> {
            let first = self.calls.fetch_add(1, Ordering::SeqCst) == 0;
            Box::pin(async move {
                if first {
                    conductor::WorkerOutcome::Blocked {
                        reason: "missing credentials".to_string(),
                    }
                } else {
                    conductor::WorkerOutcome::Completed(
                        conductor::WorkerResult::artifact_only(
                            conductor::ArtifactRef::new("artifact://a"),
                            descriptor.acceptance_criteria.len(),
                        ),
                    )
                }
            })
        }
    }

    let registry = single_worker_registry(
        "qa",
        Arc::new(BlockOnce {
            calls: std::sync::atomic::AtomicUsize::new(0),
        }),
    );
    let (coordinator, handle, mut status) =
        Coordinator::new(graph, fast_config(), registry).unwrap();

    let driver = tokio::spawn(coordinator.run());
    loop {
        let summary = status.recv().await.expect("status feed open");
        if summary.open_blockers > 0 {
            break;
        }
    }
    handle.resolve_blocker(id_a, "credentials provisioned").unwrap();
    drop(handle);

    let outcome = driver.await.unwrap().unwrap();
    let task = outcome.graph.get(&id_a).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.blocker_history.len(), 1);
    assert!(!task.blocker_history[0].is_open());
}

/// Test: Unresolved Blocker Ends The Run
/// Given a worker that always blocks and no operator
/// When every handle is dropped
/// Then the run terminates with the task still blocked
#[tokio::test]
async fn test_unresolved_blocker_terminates_without_operator() {
    let mut graph = TaskGraph::new();
    let a = test_task("a", "qa");
    let id_a = a.id;
    graph.add_task(a);

    let registry = single_worker_registry("qa", Arc::new(BlockingWorker));
    let (coordinator, handle, _status) =
        Coordinator::new(graph, fast_config(), registry).unwrap();
    drop(handle);

    let outcome = coordinator.run().await.unwrap();
    let task = outcome.graph.get(&id_a).unwrap();
    assert!(matches!(task.status, TaskStatus::Blocked { .. }));
    assert_eq!(task.open_blockers(), 1);
}

/// Test: Timeout Produces A Blocker
/// Given an invocation that outlives its timeout
/// When the run executes without an operator
/// Then the task is blocked with a Timeout reason, not failed
#[tokio::test]
async fn test_timeout_blocks_task() {
    let mut graph = TaskGraph::new();
    let a = test_task("a", "qa");
    let id_a = a.id;
    graph.add_task(a);

    let (worker, _) = SlowWorker::new(Duration::from_secs(30));
    let registry = single_worker_registry("qa", Arc::new(worker));
    let config = RunConfig {
        invocation_timeout: Duration::from_millis(10),
        ..fast_config()
    };
    let (coordinator, handle, _status) = Coordinator::new(graph, config, registry).unwrap();
    drop(handle);

    let outcome = coordinator.run().await.unwrap();
    let task = outcome.graph.get(&id_a).unwrap();
    assert!(matches!(task.status, TaskStatus::Blocked { .. }));
    assert_eq!(task.blocker_history[0].reason, BlockerReason::Timeout);
}

/// Test: Cancellation Freeze
/// Given a run with work in flight
/// When cancellation is requested and the grace period is too short
/// Then the run halts with the in-flight task frozen as it was
#[tokio::test]
async fn test_cancellation_freezes_in_flight_work() {
    let mut graph = TaskGraph::new();
    let a = test_task("a", "qa");
    let id_a = a.id;
    graph.add_task(a);

    let (worker, _) = SlowWorker::new(Duration::from_secs(30));
    let registry = single_worker_registry("qa", Arc::new(worker));
    let config = RunConfig {
        grace_timeout: Duration::from_millis(20),
        ..fast_config()
    };
    let (coordinator, handle, mut status) = Coordinator::new(graph, config, registry).unwrap();

    let driver = tokio::spawn(coordinator.run());
    loop {
        let summary = status.recv().await.expect("status feed open");
        if summary.counts.in_progress > 0 {
            break;
        }
    }
    handle.cancel();

    let outcome = driver.await.unwrap().unwrap();
    assert!(outcome.halted);
    assert_eq!(outcome.graph.get(&id_a).unwrap().status, TaskStatus::InProgress);
}

/// Records whether each descriptor carried stub inputs; optionally slow
/// on the first invocation only.
struct StubLogWorker {
    stub_log: Arc<Mutex<Vec<bool>>>,
    first_call_sleep: Duration,
    calls: AtomicUsize,
}

impl StubLogWorker {
    fn new(first_call_sleep: Duration) -> (Self, Arc<Mutex<Vec<bool>>>) {
        let stub_log = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                stub_log: Arc::clone(&stub_log),
                first_call_sleep,
                calls: AtomicUsize::new(0),
            },
            stub_log,
        )
    }
}

impl conductor::Worker for StubLogWorker {
    fn invoke(
        &self,
        descriptor: conductor::TaskDescriptor,
    ) -> futures::future::BoxFuture<'static, conductor::WorkerOutcome> {
        let first = self.calls.fetch_add(1, Ordering::SeqCst) == 0;
        self.stub_log.lock().unwrap().push(descriptor.has_stub_inputs());
        let sleep = if first { self.first_call_sleep } else { Duration::ZERO };
        Box::pin(async move {
            if !sleep.is_zero() {
                tokio::time::sleep(sleep).await;
            }
            conductor::WorkerOutcome::Completed(conductor::WorkerResult::artifact_only(
                conductor::ArtifactRef::new(format!("artifact://{}", descriptor.id.short())),
                descriptor.acceptance_criteria.len(),
            ))
        })
    }
}

fn soft_pair_registry(
    dep_worker: Arc<dyn conductor::Worker>,
    dependent_worker: Arc<dyn conductor::Worker>,
) -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    registry.register(
        WorkerProfile::new(WorkerId::new("modeler")).with_primary("data-layer", 1),
        dep_worker,
    );
    registry.register(
        WorkerProfile::new(WorkerId::new("ui")).with_primary("interface-layer", 1),
        dependent_worker,
    );
    registry
}

/// Test: Redispatch Replaces A Parked Stub Result
/// Given a soft edge under the redispatch policy and a dependent that
/// finishes on stubs before its dependency completes
/// When the dependency completes
/// Then the dependent runs again with the real artifact and completes
/// off the second result, with exactly two invocations
#[tokio::test]
async fn test_redispatch_replaces_parked_stub_result() {
    let mut graph = TaskGraph::new();
    let dep = test_task("schema", "data-layer");
    let dependent = test_task("screens", "interface-layer");
    let (id_dep, id_dependent) = (dep.id, dependent.id);
    graph.add_task(dep);
    graph.add_task(dependent);
    graph
        .add_edge(&id_dep, &id_dependent, DependencyKind::Soft)
        .unwrap();

    let (slow, _) = SlowWorker::new(Duration::from_millis(50));
    let (recorder, stub_log) = StubLogWorker::new(Duration::ZERO);
    let registry = soft_pair_registry(Arc::new(slow), Arc::new(recorder));
    let config = RunConfig {
        soft_input_policy: SoftInputPolicy::Redispatch,
        ..fast_config()
    };

    let (coordinator, handle, _status) = Coordinator::new(graph, config, registry).unwrap();
    drop(handle);

    let outcome = coordinator.run().await.unwrap();
    assert_eq!(outcome.summary.counts.completed, 2);
    assert_eq!(
        outcome.graph.get(&id_dependent).unwrap().status,
        TaskStatus::Completed
    );
    // First invocation ran on a stub, the rerun on the real artifact
    assert_eq!(*stub_log.lock().unwrap(), vec![true, false]);
}

/// Test: Redispatch Aborts An In-Flight Stub Invocation
/// Given a dependent still running on stub inputs when its soft
/// dependency completes
/// When the redispatch policy is active
/// Then the stub invocation is aborted and the rerun carries the real
/// artifact, completing the task exactly once
#[tokio::test]
async fn test_redispatch_aborts_in_flight_stub_invocation() {
    let mut graph = TaskGraph::new();
    let dep = test_task("schema", "data-layer");
    let dependent = test_task("screens", "interface-layer");
    let (id_dep, id_dependent) = (dep.id, dependent.id);
    graph.add_task(dep);
    graph.add_task(dependent);
    graph
        .add_edge(&id_dep, &id_dependent, DependencyKind::Soft)
        .unwrap();

    let (slow, _) = SlowWorker::new(Duration::from_millis(30));
    // The stub-fed invocation would outlive the whole test if not aborted
    let (recorder, stub_log) = StubLogWorker::new(Duration::from_secs(30));
    let registry = soft_pair_registry(Arc::new(slow), Arc::new(recorder));
    let config = RunConfig {
        soft_input_policy: SoftInputPolicy::Redispatch,
        ..fast_config()
    };

    let (coordinator, handle, _status) = Coordinator::new(graph, config, registry).unwrap();
    drop(handle);

    let outcome = coordinator.run().await.unwrap();
    assert_eq!(outcome.summary.counts.completed, 2);
    assert_eq!(
        outcome.graph.get(&id_dep).unwrap().status,
        TaskStatus::Completed
    );
    assert_eq!(
        outcome.graph.get(&id_dependent).unwrap().status,
        TaskStatus::Completed
    );
    assert_eq!(*stub_log.lock().unwrap(), vec![true, false]);
}

/// Test: Checkpoint And Resume
/// Given a run halted partway with some tasks completed
/// When its state is saved, loaded, and a new coordinator resumes it
/// Then the ready set matches the checkpoint and the rest completes
#[tokio::test]
async fn test_checkpoint_resume_finishes_run() {
    let mut graph = TaskGraph::new();
    let a = test_task("a", "qa");
    let b = test_task("b", "qa");
    let c = test_task("c", "qa");
    let (id_a, id_b, id_c) = (a.id, b.id, c.id);
    graph.add_task(a);
    graph.add_task(b);
    graph.add_task(c);
    graph.add_edge(&id_a, &id_b, DependencyKind::Hard).unwrap();
    graph.add_edge(&id_b, &id_c, DependencyKind::Hard).unwrap();

    // First leg: complete only the root, then stop
    graph
        .get_mut(&id_a)
        .unwrap()
        .complete(conductor::ArtifactRef::new("artifact://a"));
    let mut context = conductor::ProjectContext::new();
    context
        .artifact_registry
        .insert(id_a, conductor::ArtifactRef::new("artifact://a"));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.json");
    RunState::capture(&graph, &context).save(&path).unwrap();

    // Second leg: load and resume
    let loaded = RunState::load(&path).unwrap();
    let (restored, restored_context) = loaded.restore().unwrap();
    assert_eq!(ready_set(&restored), vec![id_b]);

    let registry = single_worker_registry("qa", Arc::new(SucceedingWorker));
    let (coordinator, handle, _status) =
        Coordinator::resume(restored, restored_context, fast_config(), registry).unwrap();
    drop(handle);

    let outcome = coordinator.run().await.unwrap();
    assert_eq!(outcome.summary.counts.completed, 3);
    assert_eq!(outcome.graph.get(&id_c).unwrap().status, TaskStatus::Completed);
    // The artifact registered before the checkpoint survived the round trip
    assert!(outcome.context.artifact(&id_a).is_some());
}
