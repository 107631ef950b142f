//! Decision precedence and conflict handling tests.
//!
//! The context synthesizer applies the configured authority order while
//! the coordinator absorbs results; these tests drive whole runs and
//! inspect the resulting decision log.

use std::sync::Arc;

use conductor::{
    ContextSynthesizer, Coordinator, DependencyKind, Health, RunConfig, TaskGraph, WorkerId,
    WorkerProfile, WorkerRegistry,
};

use crate::fixtures::{fast_config, test_task, DecidingWorker};

fn authority_config() -> RunConfig {
    RunConfig {
        authority: vec![
            "architecture".to_string(),
            "implementation".to_string(),
            "styling".to_string(),
        ],
        ..fast_config()
    }
}

/// Test: Higher Authority Supersedes
/// Given an implementation task deciding a subject, then a dependent
/// architecture task deciding it differently
/// When the run executes
/// Then both decisions stay in the log and the architecture choice is in
/// force, with no conflict flag
#[tokio::test]
async fn test_higher_authority_supersedes() {
    let mut graph = TaskGraph::new();
    let impl_task = test_task("pick-db", "implementation");
    let arch_task = test_task("review-db", "architecture");
    let (id_impl, id_arch) = (impl_task.id, arch_task.id);
    graph.add_task(impl_task);
    graph.add_task(arch_task);
    // Hard edge forces absorption order: implementation first
    graph
        .add_edge(&id_impl, &id_arch, DependencyKind::Hard)
        .unwrap();

    let mut registry = WorkerRegistry::new();
    registry.register(
        WorkerProfile::new(WorkerId::new("dev")).with_primary("implementation", 1),
        Arc::new(DecidingWorker {
            subject: "database".to_string(),
            choice: "sqlite".to_string(),
        }),
    );
    registry.register(
        WorkerProfile::new(WorkerId::new("architect")).with_primary("architecture", 1),
        Arc::new(DecidingWorker {
            subject: "database".to_string(),
            choice: "postgres".to_string(),
        }),
    );

    let config = authority_config();
    let (coordinator, handle, _status) =
        Coordinator::new(graph, config.clone(), registry).unwrap();
    drop(handle);

    let outcome = coordinator.run().await.unwrap();
    assert_eq!(outcome.summary.counts.completed, 2);
    assert_eq!(outcome.context.decision_log.len(), 2);
    assert_eq!(outcome.context.decision_log[1].supersedes, Some(0));
    assert!(outcome.context.conflict_flags.is_empty());

    let synthesizer = ContextSynthesizer::new(&config);
    let effective = synthesizer
        .effective_decision(&outcome.context, "database")
        .unwrap();
    assert_eq!(effective.choice, "postgres");
    assert_eq!(outcome.summary.health, Health::Healthy);
}

/// Test: Equal Authority Conflict
/// Given two same-category tasks deciding the same subject differently
/// When the run executes
/// Then both entries are retained, a conflict flag is raised, no task
/// fails, and health degrades to Warning
#[tokio::test]
async fn test_equal_authority_conflict_is_non_fatal() {
    // "docs" and "qa" are both absent from the authority list, so they
    // rank equal to each other
    let mut graph = TaskGraph::new();
    let first = test_task("document-client", "docs");
    let second = test_task("verify-client", "qa");
    let (id_first, id_second) = (first.id, second.id);
    graph.add_task(first);
    graph.add_task(second);
    // Serialize absorption so the scripted choices land in a fixed order
    graph
        .add_edge(&id_first, &id_second, DependencyKind::Hard)
        .unwrap();

    let mut registry = WorkerRegistry::new();
    registry.register(
        WorkerProfile::new(WorkerId::new("writer")).with_primary("docs", 1),
        Arc::new(DecidingWorker {
            subject: "http-client".to_string(),
            choice: "reqwest".to_string(),
        }),
    );
    registry.register(
        WorkerProfile::new(WorkerId::new("tester")).with_primary("qa", 1),
        Arc::new(DecidingWorker {
            subject: "http-client".to_string(),
            choice: "hyper".to_string(),
        }),
    );

    let (coordinator, handle, _status) =
        Coordinator::new(graph, authority_config(), registry).unwrap();
    drop(handle);

    let outcome = coordinator.run().await.unwrap();
    assert_eq!(outcome.summary.counts.completed, 2);
    assert_eq!(outcome.context.decision_log.len(), 2);
    assert_eq!(outcome.context.conflict_flags.len(), 1);
    assert_eq!(outcome.context.unresolved_conflicts(), 1);
    assert_eq!(outcome.summary.health, Health::Warning);

    // Both entries are live; neither superseded the other
    assert_eq!(outcome.context.live_decisions("http-client").len(), 2);
}

/// Test: Conflict Resolution Command
/// Given a run that produced an equal-authority conflict
/// When the operator settles the subject mid-run
/// Then the flag is marked resolved and health recovers
#[tokio::test]
async fn test_resolve_conflict_command() {
    let mut graph = TaskGraph::new();
    let first = test_task("one", "implementation");
    let second = test_task("two", "implementation");
    let gate = test_task("gate", "styling");
    let (id_first, id_second, id_gate) = (first.id, second.id, gate.id);
    graph.add_task(first);
    graph.add_task(second);
    graph.add_task(gate);
    graph
        .add_edge(&id_first, &id_second, DependencyKind::Hard)
        .unwrap();
    // The gate keeps the run alive long enough to accept the command
    graph
        .add_edge(&id_second, &id_gate, DependencyKind::Hard)
        .unwrap();

    let mut registry = WorkerRegistry::new();
    registry.register(
        WorkerProfile::new(WorkerId::new("dev")).with_primary("implementation", 1),
        Arc::new(DecidingWorker {
            subject: "naming".to_string(),
            choice: "kebab".to_string(),
        }),
    );
    // Slow enough that the run is still alive when the command lands
    let (gate_worker, _) = crate::fixtures::SlowWorker::new(std::time::Duration::from_millis(200));
    registry.register(
        WorkerProfile::new(WorkerId::new("stylist")).with_primary("styling", 1),
        Arc::new(gate_worker),
    );

    let (coordinator, handle, mut status) =
        Coordinator::new(graph, authority_config(), registry).unwrap();

    let driver = tokio::spawn(coordinator.run());
    // Wait for the conflict to surface, then settle it
    loop {
        let summary = status.recv().await.expect("status feed open");
        if summary.unresolved_conflicts > 0 {
            break;
        }
    }
    handle.resolve_conflict("naming").unwrap();
    drop(handle);

    let outcome = driver.await.unwrap().unwrap();
    assert_eq!(outcome.context.unresolved_conflicts(), 0);
    assert_eq!(outcome.context.conflict_flags.len(), 1);
    assert!(outcome.context.conflict_flags[0].resolved);
    assert_eq!(outcome.summary.health, Health::Healthy);
}
