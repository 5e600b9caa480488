//! Parallel coordination
//!
//! The client side of the protocol cooperating processes use to share one
//! suite run: index distribution, barriers, the one-shot before-suite
//! broadcast, report aggregation and abort propagation.

mod local;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{ProgressReport, Report, SpecReport, SpecState};

pub use local::{LocalClient, LocalServer};

/// Errors raised by parallel client calls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParallelError {
    #[error("no parallel client is connected")]
    NotConnected,

    #[error("parallel server has shut down")]
    ServerClosed,

    #[error("process {0} is not part of this run")]
    UnknownProcess(usize),

    #[error("parallel transport failed: {0}")]
    Transport(String),
}

/// Cross-process coordination client
///
/// Every call can fail; callers turn failures into suite or node failures.
#[async_trait]
pub trait ParallelClient: Send + Sync {
    /// Next group index to run
    async fn fetch_next_counter(&self) -> Result<usize, ParallelError>;

    /// Barrier: resolves once every nonprimary process has reported suite end
    async fn block_until_nonprimary_procs_have_finished(&self) -> Result<(), ParallelError>;

    async fn post_synchronized_before_suite_completed(
        &self,
        state: SpecState,
        data: Option<Vec<u8>>,
    ) -> Result<(), ParallelError>;

    /// Waits for the primary process to post its before-suite outcome
    async fn block_until_synchronized_before_suite_data(
        &self,
    ) -> Result<(SpecState, Option<Vec<u8>>), ParallelError>;

    /// Waits for every nonprimary process and returns their merged reports
    async fn block_until_aggregated_nonprimary_procs_report(&self) -> Result<Report, ParallelError>;

    async fn post_abort(&self) -> Result<(), ParallelError>;

    async fn should_abort(&self) -> bool;

    async fn post_suite_will_begin(&self, report: &Report) -> Result<(), ParallelError>;

    async fn post_did_run(&self, report: &SpecReport) -> Result<(), ParallelError>;

    async fn post_suite_did_end(&self, report: &Report) -> Result<(), ParallelError>;

    async fn post_emit_progress_report(&self, report: &ProgressReport) -> Result<(), ParallelError>;

    /// Forward captured output live to the server
    fn write_output(&self, bytes: &[u8]) -> Result<(), ParallelError>;
}
