//! Integration test suite for conductor.
//!
//! These tests drive whole runs end to end: graph construction, routing,
//! concurrent dispatch, failure propagation, context synthesis, and
//! persistence, all working together.
//!
//! # Test Categories
//!
//! - `run_e2e`: Full runs from graph to settled outcome
//! - `parallel_dispatch`: Concurrency budgets and wave ordering
//! - `conflict_resolution`: Decision precedence and conflict flags
//! - `recovery`: Retries, blockers, cancellation, persistence
//!
//! All workers are scripted in-process; no external services are touched,
//! so the suite is safe to run in CI.

mod fixtures;

mod conflict_resolution;
mod recovery;
