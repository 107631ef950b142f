//! Run state persistence.

pub mod store;

pub use store::RunState;
