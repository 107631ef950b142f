//! Execution coordinator: the single event loop that drives a run.
//!
//! The coordinator owns the graph and context outright for the duration
//! of a run. Workers only ever see descriptors and return outcomes over a
//! channel, so every status transition and every context write happens on
//! this loop, in order. Dispatch is non-blocking: an invocation runs on
//! its own tokio task and reports back through the signal channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{RunConfig, SoftInputPolicy};
use crate::core::graph::TaskGraph;
use crate::core::task::{BlockerReason, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::context::{ContextSynthesizer, ProjectContext};
use crate::orchestration::progress::{ProgressTracker, RunSummary};
use crate::orchestration::resolver;
use crate::orchestration::router::WorkerRegistry;
use crate::orchestration::worker::{DependencyInput, TaskDescriptor, WorkerOutcome, WorkerResult};
use crate::{clog, clog_debug, clog_warn};

/// Internal signals from spawned invocations back to the event loop.
#[derive(Debug)]
enum InvocationSignal {
    /// The worker returned within its timeout.
    Finished { task_id: TaskId, outcome: WorkerOutcome },
    /// The invocation exceeded its timeout and was dropped.
    TimedOut { task_id: TaskId },
    /// A retry backoff delay elapsed.
    RetryElapsed { task_id: TaskId },
}

/// Operator commands a run accepts while in flight.
#[derive(Debug)]
enum CoordinatorCommand {
    /// Resolve the open blocker on a task and return it to Ready.
    ResolveBlocker { task_id: TaskId, how: String },
    /// Settle an equal-authority decision conflict.
    ResolveConflict { subject: String },
}

/// Control handle for a running coordinator.
///
/// Cloneable; dropping every handle closes the command channel, which
/// lets a stalled run (open blockers, nothing in flight) terminate
/// instead of waiting forever.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<CoordinatorCommand>,
    cancel: CancellationToken,
}

impl CoordinatorHandle {
    /// Resolve the open blocker on a task; the task returns to Ready.
    pub fn resolve_blocker(&self, task_id: TaskId, how: &str) -> Result<()> {
        self.commands
            .send(CoordinatorCommand::ResolveBlocker {
                task_id,
                how: how.to_string(),
            })
            .map_err(|_| Error::ChannelClosed("coordinator commands"))
    }

    /// Settle an equal-authority conflict on a subject.
    pub fn resolve_conflict(&self, subject: &str) -> Result<()> {
        self.commands
            .send(CoordinatorCommand::ResolveConflict {
                subject: subject.to_string(),
            })
            .map_err(|_| Error::ChannelClosed("coordinator commands"))
    }

    /// Request cancellation: dispatch stops, in-flight invocations get the
    /// grace period, then statuses freeze.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Final state of a run.
#[derive(Debug)]
pub struct RunOutcome {
    /// The graph with final task statuses.
    pub graph: TaskGraph,
    /// The accumulated project context.
    pub context: ProjectContext,
    /// Summary at the moment the run ended.
    pub summary: RunSummary,
    /// True if the run ended by cancellation or a critical failure halt.
    pub halted: bool,
}

/// Record of one outstanding invocation.
struct InFlight {
    handle: JoinHandle<()>,
    capability: String,
    stub_inputs: bool,
}

enum LoopEvent {
    Cancelled,
    Signal(InvocationSignal),
    Command(Option<CoordinatorCommand>),
}

/// The run driver. Consumes itself in `run` and returns the final state.
pub struct Coordinator {
    graph: TaskGraph,
    config: RunConfig,
    registry: WorkerRegistry,
    context: ProjectContext,
    synthesizer: ContextSynthesizer,
    tracker: ProgressTracker,

    in_flight: HashMap<TaskId, InFlight>,
    active_per_category: HashMap<String, usize>,
    retry_counts: HashMap<TaskId, u32>,
    pending_retries: HashSet<TaskId>,
    /// Results finished on stub inputs, waiting for soft deps to settle.
    /// Concurrency budgets bound invocations, not InProgress statuses: a
    /// parked task stays InProgress but holds no slot, so a soft
    /// dependency sharing its category can still dispatch.
    parked: HashMap<TaskId, WorkerResult>,

    signal_tx: mpsc::UnboundedSender<InvocationSignal>,
    signal_rx: mpsc::UnboundedReceiver<InvocationSignal>,
    command_rx: mpsc::UnboundedReceiver<CoordinatorCommand>,
    status_tx: mpsc::UnboundedSender<RunSummary>,
    cancel: CancellationToken,
    halt: bool,
}

impl Coordinator {
    /// Build a coordinator for a graph.
    ///
    /// Returns the coordinator, a control handle, and the status feed.
    /// A summary is pushed onto the feed on every status transition.
    pub fn new(
        graph: TaskGraph,
        config: RunConfig,
        registry: WorkerRegistry,
    ) -> Result<(Self, CoordinatorHandle, mpsc::UnboundedReceiver<RunSummary>)> {
        Self::resume(graph, ProjectContext::new(), config, registry)
    }

    /// Build a coordinator over a previously captured graph and context.
    pub fn resume(
        graph: TaskGraph,
        context: ProjectContext,
        config: RunConfig,
        registry: WorkerRegistry,
    ) -> Result<(Self, CoordinatorHandle, mpsc::UnboundedReceiver<RunSummary>)> {
        config.validate()?;
        if !graph.is_acyclic() {
            return Err(Error::Validation(
                "task graph contains a cycle".to_string(),
            ));
        }

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let handle = CoordinatorHandle {
            commands: command_tx,
            cancel: cancel.clone(),
        };
        let coordinator = Self {
            synthesizer: ContextSynthesizer::new(&config),
            tracker: ProgressTracker::new(&config),
            graph,
            config,
            registry,
            context,
            in_flight: HashMap::new(),
            active_per_category: HashMap::new(),
            retry_counts: HashMap::new(),
            pending_retries: HashSet::new(),
            parked: HashMap::new(),
            signal_tx,
            signal_rx,
            command_rx,
            status_tx,
            cancel,
            halt: false,
        };
        Ok((coordinator, handle, status_rx))
    }

    /// Drive the run to its end: all tasks settled, a critical halt,
    /// cancellation, or a stall nobody can resolve any more.
    pub async fn run(mut self) -> Result<RunOutcome> {
        clog!(
            "Run started: {} tasks, {} edges",
            self.graph.task_count(),
            self.graph.edge_count()
        );
        let mut commands_closed = false;
        let mut halted = false;

        self.promote_and_dispatch()?;

        loop {
            if self.all_settled() {
                break;
            }
            if self.halt {
                clog_warn!("Critical task failed terminally, halting run");
                self.shutdown_with_grace().await?;
                halted = true;
                break;
            }
            if self.stalled() && commands_closed {
                clog_warn!("Run stalled with no command channel, terminating");
                break;
            }

            let event = tokio::select! {
                _ = self.cancel.cancelled() => LoopEvent::Cancelled,
                Some(signal) = self.signal_rx.recv() => LoopEvent::Signal(signal),
                command = self.command_rx.recv(), if !commands_closed => {
                    LoopEvent::Command(command)
                }
            };

            match event {
                LoopEvent::Cancelled => {
                    clog!("Cancellation requested");
                    self.shutdown_with_grace().await?;
                    halted = true;
                    break;
                }
                LoopEvent::Signal(signal) => self.handle_signal(signal)?,
                LoopEvent::Command(Some(command)) => self.handle_command(command)?,
                LoopEvent::Command(None) => {
                    commands_closed = true;
                    continue;
                }
            }

            self.promote_and_dispatch()?;
        }

        let summary = self.tracker.summarize(&self.graph, &self.context);
        clog!(
            "Run ended: {} completed, {} failed, health {}",
            summary.counts.completed,
            summary.counts.failed_terminal,
            summary.health
        );
        Ok(RunOutcome {
            graph: self.graph,
            context: self.context,
            summary,
            halted,
        })
    }

    fn all_settled(&self) -> bool {
        self.graph.tasks().all(|t| t.is_finished())
    }

    /// Nothing in flight, no retry timer pending, nothing dispatchable.
    /// Only a command (blocker resolution) or cancellation can make
    /// progress from here.
    fn stalled(&self) -> bool {
        self.in_flight.is_empty()
            && self.pending_retries.is_empty()
            && self
                .graph
                .tasks()
                .all(|t| t.status != TaskStatus::Ready)
            && resolver::ready_set(&self.graph).is_empty()
    }

    // ---- dispatch ----

    fn promote_and_dispatch(&mut self) -> Result<()> {
        self.promote_ready();
        self.dispatch()
    }

    /// Promote Pending tasks whose hard dependencies all completed.
    fn promote_ready(&mut self) {
        for id in resolver::ready_set(&self.graph) {
            if let Some(task) = self.graph.get_mut(&id) {
                task.mark_ready();
                clog_debug!("Task {} promoted to ready", id.short());
                self.emit_status();
            }
        }
    }

    /// Dispatch Ready tasks up to each capability's concurrency budget.
    fn dispatch(&mut self) -> Result<()> {
        let mut ready: Vec<TaskId> = self
            .graph
            .tasks()
            .filter(|t| t.status == TaskStatus::Ready)
            .map(|t| t.id)
            .collect();
        ready.sort();

        for id in ready {
            self.dispatch_one(&id)?;
        }
        Ok(())
    }

    fn dispatch_one(&mut self, id: &TaskId) -> Result<()> {
        let task = self.graph.get(id).ok_or(Error::TaskNotFound(*id))?;
        // A retry keeps the capability pinned at first dispatch
        let capability = task
            .assigned_capability
            .clone()
            .unwrap_or_else(|| task.category.clone());

        let active = self
            .active_per_category
            .get(&capability)
            .copied()
            .unwrap_or(0);
        if active >= self.config.capacity_for(&capability) {
            return Ok(());
        }

        let selection = match self.registry.route(&capability) {
            Ok(selection) => selection,
            Err(Error::NoCapableWorker { category }) => {
                clog_warn!("No capable worker for '{}', task {} fails", category, id.short());
                self.fail_terminally(id, &format!("no capable worker for '{}'", category));
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let worker = self
            .registry
            .executor(&selection.worker_id)
            .ok_or(Error::ChannelClosed("worker executor missing"))?;

        let descriptor = self.descriptor_for(id)?;
        let stub_inputs = descriptor.has_stub_inputs();

        let task = self.graph.get_mut(id).ok_or(Error::TaskNotFound(*id))?;
        task.start(&capability);
        clog!(
            "Task {} dispatched to {} (capability {})",
            id.short(),
            selection.worker_id,
            capability
        );
        self.emit_status();

        *self.active_per_category.entry(capability.clone()).or_insert(0) += 1;

        let handle = spawn_invocation(
            worker,
            descriptor,
            self.config.invocation_timeout,
            self.signal_tx.clone(),
        );
        self.in_flight.insert(
            *id,
            InFlight {
                handle,
                capability,
                stub_inputs,
            },
        );
        Ok(())
    }

    /// Build the descriptor for one dispatch: real artifacts for completed
    /// dependencies, stubs for soft dependencies still unfinished.
    fn descriptor_for(&self, id: &TaskId) -> Result<TaskDescriptor> {
        let task = self.graph.get(id).ok_or(Error::TaskNotFound(*id))?;
        let mut inputs = Vec::new();
        let mut deps = self.graph.dependencies(id);
        deps.sort_by_key(|(dep, _)| dep.id);
        for (dep, _) in deps {
            match (&dep.status, &dep.result) {
                (TaskStatus::Completed, Some(artifact)) => {
                    inputs.push(DependencyInput::Artifact {
                        task_id: dep.id,
                        artifact: artifact.clone(),
                    });
                }
                _ => inputs.push(DependencyInput::Stub {
                    task_id: dep.id,
                    placeholder: format!("pending output of '{}'", dep.title),
                }),
            }
        }
        Ok(TaskDescriptor {
            id: task.id,
            category: task.category.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            acceptance_criteria: task
                .acceptance_criteria
                .iter()
                .map(|c| c.description.clone())
                .collect(),
            inputs,
        })
    }

    // ---- signal handling ----

    fn handle_signal(&mut self, signal: InvocationSignal) -> Result<()> {
        match signal {
            InvocationSignal::Finished { task_id, outcome } => {
                self.release_in_flight(&task_id);
                // A signal can outlive its invocation when the task was
                // aborted and returned to Ready; only InProgress tasks
                // accept outcomes
                if !self.is_in_progress(&task_id) {
                    return Ok(());
                }
                self.handle_outcome(task_id, outcome)
            }
            InvocationSignal::TimedOut { task_id } => {
                self.release_in_flight(&task_id);
                if !self.is_in_progress(&task_id) {
                    return Ok(());
                }
                clog_warn!("Task {} invocation timed out", task_id.short());
                if let Some(task) = self.graph.get_mut(&task_id) {
                    task.block(BlockerReason::Timeout);
                    self.emit_status();
                }
                Ok(())
            }
            InvocationSignal::RetryElapsed { task_id } => {
                self.pending_retries.remove(&task_id);
                if let Some(task) = self.graph.get_mut(&task_id) {
                    if matches!(task.status, TaskStatus::Failed { terminal: false, .. }) {
                        task.mark_ready();
                        clog_debug!("Task {} ready for retry", task_id.short());
                        self.emit_status();
                    }
                }
                Ok(())
            }
        }
    }

    fn is_in_progress(&self, id: &TaskId) -> bool {
        self.graph
            .get(id)
            .map(|t| t.status == TaskStatus::InProgress)
            .unwrap_or(false)
    }

    fn release_in_flight(&mut self, id: &TaskId) {
        if let Some(inflight) = self.in_flight.remove(id) {
            if let Some(count) = self.active_per_category.get_mut(&inflight.capability) {
                *count = count.saturating_sub(1);
            }
        }
    }

    fn handle_outcome(&mut self, task_id: TaskId, outcome: WorkerOutcome) -> Result<()> {
        match outcome {
            WorkerOutcome::Completed(result) => self.handle_completed(task_id, result),
            WorkerOutcome::Blocked { reason } => {
                clog_warn!("Task {} blocked by worker: {}", task_id.short(), reason);
                if let Some(task) = self.graph.get_mut(&task_id) {
                    task.block(BlockerReason::WorkerRaised { detail: reason });
                    self.emit_status();
                }
                Ok(())
            }
            WorkerOutcome::Failed { error } => self.handle_failure(&task_id, &error),
        }
    }

    fn handle_completed(&mut self, task_id: TaskId, result: WorkerResult) -> Result<()> {
        let Some(task) = self.graph.get(&task_id) else {
            return Ok(());
        };
        // An artifact that skips criteria is not a success
        if !result.all_criteria_met(task.acceptance_criteria.len()) {
            clog_warn!("Task {} result left criteria unmet", task_id.short());
            return self.handle_failure(&task_id, "acceptance criteria unmet");
        }

        if !self.unfinished_soft_deps(&task_id).is_empty() {
            // Cannot complete past an unfinished soft dependency; park the
            // result until the dependency settles
            clog_debug!("Task {} parked on soft dependencies", task_id.short());
            self.parked.insert(task_id, result);
            return Ok(());
        }

        self.complete_task(task_id, result);
        Ok(())
    }

    fn complete_task(&mut self, task_id: TaskId, result: WorkerResult) {
        let category = match self.graph.get_mut(&task_id) {
            Some(task) => {
                task.complete(result.artifact.clone());
                task.category.clone()
            }
            None => return,
        };
        self.synthesizer
            .absorb(&mut self.context, task_id, &category, &result);
        clog!("Task {} completed", task_id.short());
        self.emit_status();
        self.settle_soft_dependents(task_id);
    }

    /// A task reached a terminal state: settle soft dependents that were
    /// parked on it or are in flight on stub inputs. A terminally failed
    /// soft dependency stops gating its dependents; they proceed on the
    /// stubs they were given.
    fn settle_soft_dependents(&mut self, settled: TaskId) {
        let soft_dependents: Vec<TaskId> = self
            .graph
            .dependents(&settled)
            .into_iter()
            .filter(|(_, kind)| *kind == crate::core::graph::DependencyKind::Soft)
            .map(|(task, _)| task.id)
            .collect();

        let settled_completed = self
            .graph
            .get(&settled)
            .map(|t| t.status == TaskStatus::Completed)
            .unwrap_or(false);

        for dependent in soft_dependents {
            if !self.unfinished_soft_deps(&dependent).is_empty() {
                continue;
            }
            if let Some(result) = self.parked.remove(&dependent) {
                match self.config.soft_input_policy {
                    SoftInputPolicy::FinishWithStubs => {
                        self.complete_task(dependent, result);
                    }
                    SoftInputPolicy::Redispatch if settled_completed => {
                        // Discard the stub-based result; the next dispatch
                        // carries the real artifact
                        if let Some(task) = self.graph.get_mut(&dependent) {
                            task.mark_ready();
                            self.emit_status();
                        }
                    }
                    SoftInputPolicy::Redispatch => {
                        // The dependency failed; a rerun would see the same
                        // stubs, so the parked result stands
                        self.complete_task(dependent, result);
                    }
                }
            } else if settled_completed
                && self.config.soft_input_policy == SoftInputPolicy::Redispatch
            {
                let redispatch = self
                    .in_flight
                    .get(&dependent)
                    .is_some_and(|inflight| inflight.stub_inputs);
                if redispatch {
                    if let Some(inflight) = self.in_flight.remove(&dependent) {
                        inflight.handle.abort();
                        if let Some(count) =
                            self.active_per_category.get_mut(&inflight.capability)
                        {
                            *count = count.saturating_sub(1);
                        }
                    }
                    if let Some(task) = self.graph.get_mut(&dependent) {
                        task.mark_ready();
                        clog_debug!(
                            "Task {} redispatched with real inputs",
                            dependent.short()
                        );
                        self.emit_status();
                    }
                }
            }
        }
    }

    /// Soft dependencies that are neither completed nor terminally failed.
    /// Terminal failure stops gating: the dependent proceeds on stubs.
    fn unfinished_soft_deps(&self, id: &TaskId) -> Vec<TaskId> {
        self.graph
            .soft_dependencies(id)
            .into_iter()
            .filter(|dep| {
                self.graph
                    .get(dep)
                    .map(|t| !t.status.is_terminal())
                    .unwrap_or(false)
            })
            .collect()
    }

    fn handle_failure(&mut self, task_id: &TaskId, error: &str) -> Result<()> {
        let attempts = self.retry_counts.entry(*task_id).or_insert(0);
        if *attempts < self.config.max_retries {
            *attempts += 1;
            let attempt = *attempts;
            let delay = self
                .config
                .retry_base_delay
                .saturating_mul(1u32 << (attempt - 1).min(16));
            if let Some(task) = self.graph.get_mut(task_id) {
                task.fail(error, false);
                self.emit_status();
            }
            clog_warn!(
                "Task {} failed (attempt {}), retrying in {:?}",
                task_id.short(),
                attempt,
                delay
            );
            self.pending_retries.insert(*task_id);
            let tx = self.signal_tx.clone();
            let id = *task_id;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(InvocationSignal::RetryElapsed { task_id: id });
            });
        } else {
            clog_warn!("Task {} failed terminally: {}", task_id.short(), error);
            self.fail_terminally(task_id, error);
        }
        Ok(())
    }

    fn fail_terminally(&mut self, task_id: &TaskId, error: &str) {
        if let Some(task) = self.graph.get_mut(task_id) {
            task.fail(error, true);
            self.emit_status();
        }
        self.propagate_upstream_failure(*task_id);
        self.settle_soft_dependents(*task_id);
        if self.config.critical_task_ids.contains(task_id) {
            self.halt = true;
        }
    }

    /// Block everything hard-downstream of a terminal failure. The derived
    /// blockers keep the failure visible instead of leaving dependents
    /// silently pending forever.
    fn propagate_upstream_failure(&mut self, failed: TaskId) {
        let mut frontier = vec![failed];
        let mut seen = HashSet::new();
        while let Some(current) = frontier.pop() {
            for dependent in self.graph.hard_dependents(&current) {
                if !seen.insert(dependent) {
                    continue;
                }
                let blockable = self
                    .graph
                    .get(&dependent)
                    .map(|t| {
                        matches!(t.status, TaskStatus::Pending | TaskStatus::Ready)
                    })
                    .unwrap_or(false);
                if blockable {
                    if let Some(task) = self.graph.get_mut(&dependent) {
                        task.block(BlockerReason::UpstreamFailed { upstream: failed });
                        self.emit_status();
                    }
                }
                frontier.push(dependent);
            }
        }
    }

    // ---- commands ----

    fn handle_command(&mut self, command: CoordinatorCommand) -> Result<()> {
        match command {
            CoordinatorCommand::ResolveBlocker { task_id, how } => {
                if let Some(task) = self.graph.get_mut(&task_id) {
                    if matches!(task.status, TaskStatus::Blocked { .. })
                        && task.resolve_blocker(&how)
                    {
                        task.mark_ready();
                        clog!("Blocker on task {} resolved: {}", task_id.short(), how);
                        self.emit_status();
                    }
                }
            }
            CoordinatorCommand::ResolveConflict { subject } => {
                let settled = self.context.resolve_conflicts(&subject);
                if settled > 0 {
                    clog!("{} conflict(s) on '{}' settled", settled, subject);
                    self.emit_status();
                }
            }
        }
        Ok(())
    }

    // ---- shutdown ----

    /// Stop dispatching, give in-flight invocations the grace period to
    /// finish, abort the rest. Statuses are frozen afterwards.
    async fn shutdown_with_grace(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.config.grace_timeout;
        while !self.in_flight.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.signal_rx.recv()).await {
                Ok(Some(signal)) => self.handle_signal(signal)?,
                _ => break,
            }
        }
        for (id, inflight) in self.in_flight.drain() {
            clog_warn!("Aborting in-flight task {}", id.short());
            inflight.handle.abort();
        }
        Ok(())
    }

    fn emit_status(&self) {
        let summary = self.tracker.summarize(&self.graph, &self.context);
        let _ = self.status_tx.send(summary);
    }
}

fn spawn_invocation(
    worker: Arc<dyn crate::orchestration::worker::Worker>,
    descriptor: TaskDescriptor,
    invocation_timeout: std::time::Duration,
    tx: mpsc::UnboundedSender<InvocationSignal>,
) -> JoinHandle<()> {
    let task_id = descriptor.id;
    tokio::spawn(async move {
        match tokio::time::timeout(invocation_timeout, worker.invoke(descriptor)).await {
            Ok(outcome) => {
                let _ = tx.send(InvocationSignal::Finished { task_id, outcome });
            }
            Err(_) => {
                let _ = tx.send(InvocationSignal::TimedOut { task_id });
            }
        }
    })
}
