//! Spec Engine - execution core for behavior-driven test suites
//!
//! Runs a tree of declared nodes (containers, setup and teardown nodes,
//! leaf specs, suite-level nodes, cleanup and reporting nodes) with node and
//! suite timeouts, grace periods, escalating interrupts, progress polling
//! and optional coordination between several cooperating processes.
//!
//! ## Features
//!
//! - Blocking and async node bodies, each run on its own worker
//! - Per-node, per-spec and suite-wide deadlines with grace periods
//! - Three-level interrupt escalation (cleanup and report, report only, bail out)
//! - Progress reports on a poll timer or on request (SIGUSR1)
//! - Synchronized before/after-suite nodes across processes
//! - Deferred cleanup registered from running code
//! - Tracing-based reporter and table, JSON and summary report formats
//!
//! ## Usage
//!
//! ```no_run
//! use spec_engine::config::SuiteConfig;
//! use spec_engine::models::{BodyError, Node, NodeBody};
//! use spec_engine::suite::{Collaborators, Suite};
//!
//! # async fn example() -> Result<(), spec_engine::suite::SuiteError> {
//! let mut suite = Suite::new();
//! suite.push_node(Node::container("Cache", |s| {
//!     s.push_node(Node::it("stores entries", NodeBody::blocking(|| Ok(()))))?;
//!     s.push_node(Node::it(
//!         "evicts entries",
//!         NodeBody::blocking(|| Err(BodyError::fail("nothing evicted"))),
//!     ))
//! }))?;
//! suite.build_tree()?;
//!
//! let passed = suite
//!     .run("cache", "./tests", Collaborators::default(), SuiteConfig::default())
//!     .await;
//! assert!(!passed);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod executor;
pub mod interrupt;
pub mod models;
pub mod output;
pub mod parallel;
pub mod reporter;
pub mod suite;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;
