//! Node execution engine
//!
//! Runs individual nodes with timeout, grace period, interrupt and progress
//! polling semantics, orchestrates suite-level nodes and runs spec groups.

mod group;
mod node;
mod progress;
mod suite_nodes;
mod worker;

pub use group::{GroupRunner, OrderedGroup};
pub(crate) use progress::elapsed;
