//! Shared project context and the synthesizer that folds worker results
//! into it.
//!
//! The context has exactly one writer: the coordinator absorbs each
//! completed result through a `ContextSynthesizer` before the next
//! dispatch can observe it. Workers never mutate shared state. The
//! decision log is append-only; superseding a decision appends a new
//! entry that points at the one it replaces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::clog_debug;
use crate::config::RunConfig;
use crate::core::task::TaskId;
use crate::orchestration::worker::{ArtifactRef, WorkerResult};

/// One entry in the append-only decision log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionEntry {
    /// The task whose result carried the decision.
    pub task_id: TaskId,
    /// Category of the authoring task, used for authority ranking.
    pub author_category: String,
    /// What the decision is about (the conflict key).
    pub subject: String,
    /// The chosen option.
    pub choice: String,
    /// Why it was chosen.
    pub rationale: String,
    /// When the worker made the decision.
    pub decided_at: DateTime<Utc>,
    /// Log index of the entry this one supersedes, if any.
    pub supersedes: Option<usize>,
}

/// A recorded same-authority disagreement. Non-fatal: both decisions
/// stay in the log and the flag surfaces in progress reports until
/// resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictFlag {
    /// The contested subject.
    pub subject: String,
    /// Log index of the earlier decision.
    pub first: usize,
    /// Log index of the later, conflicting decision.
    pub second: usize,
    /// Whether an operator has settled the conflict.
    pub resolved: bool,
}

/// Accumulated shared state of a run.
///
/// Serializable as a whole so a run can be checkpointed and resumed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectContext {
    /// Append-only decision log, in absorption order.
    pub decision_log: Vec<DecisionEntry>,
    /// Artifact produced by each completed task.
    pub artifact_registry: BTreeMap<TaskId, ArtifactRef>,
    /// Same-authority disagreements, in detection order.
    pub conflict_flags: Vec<ConflictFlag>,
}

impl ProjectContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The artifact a completed task produced, if registered.
    pub fn artifact(&self, id: &TaskId) -> Option<&ArtifactRef> {
        self.artifact_registry.get(id)
    }

    /// Number of conflicts no operator has settled yet.
    pub fn unresolved_conflicts(&self) -> usize {
        self.conflict_flags.iter().filter(|f| !f.resolved).count()
    }

    /// Mark every open conflict on a subject resolved. Returns how many
    /// flags were settled.
    pub fn resolve_conflicts(&mut self, subject: &str) -> usize {
        let mut settled = 0;
        for flag in &mut self.conflict_flags {
            if !flag.resolved && flag.subject == subject {
                flag.resolved = true;
                settled += 1;
            }
        }
        settled
    }

    /// Log indices that have been superseded by a later entry.
    fn superseded(&self) -> HashSet<usize> {
        self.decision_log
            .iter()
            .filter_map(|e| e.supersedes)
            .collect()
    }

    /// Entries on a subject that no later entry has superseded.
    pub fn live_decisions(&self, subject: &str) -> Vec<&DecisionEntry> {
        let superseded = self.superseded();
        self.decision_log
            .iter()
            .enumerate()
            .filter(|(i, e)| e.subject == subject && !superseded.contains(i))
            .map(|(_, e)| e)
            .collect()
    }
}

/// Folds worker results into the project context under the configured
/// authority order.
///
/// Precedence on a contested subject:
/// higher authority supersedes, equal authority keeps both and raises a
/// `ConflictFlag`, lower authority is recorded but immediately
/// superseded by the standing higher-authority entry.
#[derive(Debug, Clone)]
pub struct ContextSynthesizer {
    config: RunConfig,
}

impl ContextSynthesizer {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn rank(&self, category: &str) -> usize {
        self.config.authority_rank(category)
    }

    /// Absorb one completed result: register its artifact and fold its
    /// decisions into the log.
    ///
    /// Deterministic and replay-safe: decisions carry their own
    /// timestamps, so absorbing the same results in the same order into a
    /// fresh context reproduces an identical one.
    pub fn absorb(
        &self,
        context: &mut ProjectContext,
        task_id: TaskId,
        author_category: &str,
        result: &WorkerResult,
    ) {
        context
            .artifact_registry
            .insert(task_id, result.artifact.clone());

        for decision in &result.decisions {
            self.fold_decision(context, task_id, author_category, decision);
        }
    }

    fn fold_decision(
        &self,
        context: &mut ProjectContext,
        task_id: TaskId,
        author_category: &str,
        decision: &crate::orchestration::worker::Decision,
    ) {
        let new_rank = self.rank(author_category);
        let superseded = context.superseded();

        // The standing entry: latest live decision on this subject
        let standing = context
            .decision_log
            .iter()
            .enumerate()
            .filter(|(i, e)| e.subject == decision.subject && !superseded.contains(i))
            .last()
            .map(|(i, e)| (i, self.rank(&e.author_category)));

        let new_index = context.decision_log.len();
        let mut entry = DecisionEntry {
            task_id,
            author_category: author_category.to_string(),
            subject: decision.subject.clone(),
            choice: decision.choice.clone(),
            rationale: decision.rationale.clone(),
            decided_at: decision.decided_at,
            supersedes: None,
        };

        match standing {
            None => {
                context.decision_log.push(entry);
            }
            Some((standing_index, standing_rank)) if new_rank < standing_rank => {
                // Higher authority wins; the old entry stays in the log
                entry.supersedes = Some(standing_index);
                clog_debug!(
                    "Decision on '{}' superseded by higher authority '{}'",
                    decision.subject,
                    author_category
                );
                context.decision_log.push(entry);
            }
            Some((standing_index, standing_rank)) if new_rank == standing_rank => {
                // A matching choice is a reaffirmation, not a conflict
                let disagrees = context.decision_log[standing_index].choice != entry.choice;
                context.decision_log.push(entry);
                if disagrees {
                    context.conflict_flags.push(ConflictFlag {
                        subject: decision.subject.clone(),
                        first: standing_index,
                        second: new_index,
                        resolved: false,
                    });
                    clog_debug!(
                        "Equal-authority conflict on '{}' between entries {} and {}",
                        decision.subject,
                        standing_index,
                        new_index
                    );
                }
            }
            Some((standing_index, _)) => {
                // Lower authority: recorded for the audit trail, but the
                // standing decision immediately supersedes it
                context.decision_log.push(entry);
                let standing_entry = context.decision_log[standing_index].clone();
                context.decision_log.push(DecisionEntry {
                    supersedes: Some(new_index),
                    ..standing_entry
                });
            }
        }
    }

    /// The decision currently in force on a subject: the latest live
    /// entry with the highest authority.
    pub fn effective_decision<'a>(
        &self,
        context: &'a ProjectContext,
        subject: &str,
    ) -> Option<&'a DecisionEntry> {
        context
            .live_decisions(subject)
            .into_iter()
            .min_by_key(|e| self.rank(&e.author_category))
    }
}
