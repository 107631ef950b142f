//! Core data structures: tasks and the dependency graph.

pub mod graph;
pub mod task;
