//! Spec context
//!
//! The cancellable handle passed into running node bodies.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

use crate::models::SpecReport;
use crate::suite::SharedState;

/// Producer of ad-hoc progress text, queried when a progress report is captured
pub type ProgressReporterFn = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Default)]
struct ReporterRegistry {
    next_id: u64,
    reporters: BTreeMap<u64, ProgressReporterFn>,
}

/// Cancellation signal and progress reporter registry for one node execution
#[derive(Clone)]
pub struct SpecContext {
    token: CancellationToken,
    reporters: Arc<Mutex<ReporterRegistry>>,
    suite: Weak<SharedState>,
}

impl SpecContext {
    pub(crate) fn new(suite: Weak<SharedState>) -> Self {
        Self {
            token: CancellationToken::new(),
            reporters: Arc::new(Mutex::new(ReporterRegistry::default())),
            suite,
        }
    }

    /// A context that is not attached to any suite
    pub fn detached() -> Self {
        Self::new(Weak::new())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the node has been told to stop
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// Register a progress reporter; returns an id for [`Self::detach_progress_reporter`]
    pub fn attach_progress_reporter<F>(&self, reporter: F) -> u64
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        let mut registry = self.reporters.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.reporters.insert(id, Arc::new(reporter));
        id
    }

    pub fn detach_progress_reporter(&self, id: u64) {
        self.reporters.lock().reporters.remove(&id);
    }

    /// Query every registered reporter in registration order
    pub fn query_progress_reporters(&self) -> Vec<String> {
        let reporters: Vec<ProgressReporterFn> =
            self.reporters.lock().reporters.values().cloned().collect();
        reporters.iter().map(|reporter| reporter()).collect()
    }

    /// Snapshot of the spec report currently being recorded
    pub fn spec_report(&self) -> Option<SpecReport> {
        self.suite.upgrade().map(|suite| suite.current_spec_report())
    }
}

impl std::fmt::Debug for SpecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecContext")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
