//! In-process parallel server
//!
//! Lets several suites running in one runtime cooperate as if they were
//! separate processes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use super::{ParallelClient, ParallelError};
use crate::models::{ProgressReport, Report, SpecReport, SpecState};

type BeforeSuiteData = Option<(SpecState, Option<Vec<u8>>)>;

struct ServerState {
    total: usize,
    counter: AtomicUsize,
    abort: AtomicBool,
    finished_nonprimary: watch::Sender<usize>,
    before_suite: watch::Sender<BeforeSuiteData>,
    aggregated: Mutex<Option<Report>>,
    output: Mutex<Vec<u8>>,
    progress_reports: Mutex<Vec<ProgressReport>>,
    did_run: Mutex<Vec<SpecReport>>,
    suites_begun: AtomicUsize,
}

/// Server shared by every cooperating process of a run
#[derive(Clone)]
pub struct LocalServer {
    state: Arc<ServerState>,
}

impl LocalServer {
    pub fn new(total: usize) -> Self {
        let (finished_nonprimary, _) = watch::channel(0);
        let (before_suite, _) = watch::channel(None);
        Self {
            state: Arc::new(ServerState {
                total,
                counter: AtomicUsize::new(0),
                abort: AtomicBool::new(false),
                finished_nonprimary,
                before_suite,
                aggregated: Mutex::new(None),
                output: Mutex::new(Vec::new()),
                progress_reports: Mutex::new(Vec::new()),
                did_run: Mutex::new(Vec::new()),
                suites_begun: AtomicUsize::new(0),
            }),
        }
    }

    /// Client for the 1-based `process`
    pub fn client(&self, process: usize) -> Result<LocalClient, ParallelError> {
        if process == 0 || process > self.state.total {
            return Err(ParallelError::UnknownProcess(process));
        }
        Ok(LocalClient {
            process,
            state: Arc::clone(&self.state),
        })
    }

    pub fn total(&self) -> usize {
        self.state.total
    }

    /// Output forwarded by clients, in arrival order
    pub fn forwarded_output(&self) -> Vec<u8> {
        self.state.output.lock().clone()
    }

    pub fn progress_reports(&self) -> Vec<ProgressReport> {
        self.state.progress_reports.lock().clone()
    }

    pub fn did_run_reports(&self) -> Vec<SpecReport> {
        self.state.did_run.lock().clone()
    }

    pub fn suites_begun(&self) -> usize {
        self.state.suites_begun.load(Ordering::SeqCst)
    }

    pub fn abort_requested(&self) -> bool {
        self.state.abort.load(Ordering::SeqCst)
    }
}

/// Client handle for one cooperating process
#[derive(Clone)]
pub struct LocalClient {
    process: usize,
    state: Arc<ServerState>,
}

impl LocalClient {
    pub fn process(&self) -> usize {
        self.process
    }
}

#[async_trait]
impl ParallelClient for LocalClient {
    async fn fetch_next_counter(&self) -> Result<usize, ParallelError> {
        Ok(self.state.counter.fetch_add(1, Ordering::SeqCst))
    }

    async fn block_until_nonprimary_procs_have_finished(&self) -> Result<(), ParallelError> {
        let nonprimary = self.state.total.saturating_sub(1);
        let mut rx = self.state.finished_nonprimary.subscribe();
        rx.wait_for(|finished| *finished >= nonprimary)
            .await
            .map_err(|_| ParallelError::ServerClosed)?;
        Ok(())
    }

    async fn post_synchronized_before_suite_completed(
        &self,
        state: SpecState,
        data: Option<Vec<u8>>,
    ) -> Result<(), ParallelError> {
        debug!(process = self.process, state = %state, "posting before-suite outcome");
        self.state.before_suite.send_replace(Some((state, data)));
        Ok(())
    }

    async fn block_until_synchronized_before_suite_data(
        &self,
    ) -> Result<(SpecState, Option<Vec<u8>>), ParallelError> {
        let mut rx = self.state.before_suite.subscribe();
        let posted = rx
            .wait_for(|data| data.is_some())
            .await
            .map_err(|_| ParallelError::ServerClosed)?;
        posted.clone().ok_or(ParallelError::ServerClosed)
    }

    async fn block_until_aggregated_nonprimary_procs_report(&self) -> Result<Report, ParallelError> {
        self.block_until_nonprimary_procs_have_finished().await?;
        let aggregated = self.state.aggregated.lock().clone();
        Ok(aggregated.unwrap_or_else(|| Report {
            suite_succeeded: true,
            ..Default::default()
        }))
    }

    async fn post_abort(&self) -> Result<(), ParallelError> {
        self.state.abort.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn should_abort(&self) -> bool {
        self.state.abort.load(Ordering::SeqCst)
    }

    async fn post_suite_will_begin(&self, _report: &Report) -> Result<(), ParallelError> {
        self.state.suites_begun.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn post_did_run(&self, report: &SpecReport) -> Result<(), ParallelError> {
        self.state.did_run.lock().push(report.clone());
        Ok(())
    }

    async fn post_suite_did_end(&self, report: &Report) -> Result<(), ParallelError> {
        if self.process == 1 {
            return Ok(());
        }
        {
            let mut aggregated = self.state.aggregated.lock();
            let merged = match aggregated.take() {
                Some(existing) => existing.add(report.clone()),
                None => report.clone(),
            };
            *aggregated = Some(merged);
        }
        self.state.finished_nonprimary.send_modify(|finished| *finished += 1);
        Ok(())
    }

    async fn post_emit_progress_report(&self, report: &ProgressReport) -> Result<(), ParallelError> {
        self.state.progress_reports.lock().push(report.clone());
        Ok(())
    }

    fn write_output(&self, bytes: &[u8]) -> Result<(), ParallelError> {
        self.state.output.lock().extend_from_slice(bytes);
        Ok(())
    }
}
