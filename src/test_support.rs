//! Shared fixtures for unit tests

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::SuiteConfig;
use crate::models::{ProgressReport, Report, SpecReport};
use crate::output::OutputInterceptor;
use crate::parallel::ParallelClient;
use crate::reporter::Reporter;
use crate::suite::{Collaborators, Phase, Suite};

/// Reporter that records every event it receives
#[derive(Default)]
pub(crate) struct RecordingReporter {
    events: Mutex<Vec<String>>,
    will_run: Mutex<Vec<SpecReport>>,
    did_run: Mutex<Vec<SpecReport>>,
    progress: Mutex<Vec<ProgressReport>>,
    final_report: Mutex<Option<Report>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn will_run_reports(&self) -> Vec<SpecReport> {
        self.will_run.lock().clone()
    }

    pub fn did_run_reports(&self) -> Vec<SpecReport> {
        self.did_run.lock().clone()
    }

    pub fn progress_reports(&self) -> Vec<ProgressReport> {
        self.progress.lock().clone()
    }

    pub fn final_report(&self) -> Option<Report> {
        self.final_report.lock().clone()
    }

    fn record(&self, event: &str) {
        self.events.lock().push(event.to_string());
    }
}

impl Reporter for RecordingReporter {
    fn suite_will_begin(&self, _report: &Report) {
        self.record("suite_will_begin");
    }

    fn will_run(&self, report: &SpecReport) {
        self.record("will_run");
        self.will_run.lock().push(report.clone());
    }

    fn did_run(&self, report: &SpecReport) {
        self.record("did_run");
        self.did_run.lock().push(report.clone());
    }

    fn emit_progress_report(&self, report: &ProgressReport) {
        self.record("emit_progress_report");
        self.progress.lock().push(report.clone());
    }

    fn suite_did_end(&self, report: &Report) {
        self.record("suite_did_end");
        *self.final_report.lock() = Some(report.clone());
    }
}

/// Interceptor that always "captures" the same output
///
/// Forwarding writes that output straight to the client, so forwarded
/// output shows up on the server once per forward.
pub(crate) struct ScriptedInterceptor {
    output: String,
    forwards: AtomicUsize,
}

impl ScriptedInterceptor {
    pub fn returning(output: &str) -> Self {
        Self {
            output: output.to_string(),
            forwards: AtomicUsize::new(0),
        }
    }

    pub fn forwards(&self) -> usize {
        self.forwards.load(Ordering::SeqCst)
    }
}

impl OutputInterceptor for ScriptedInterceptor {
    fn start_intercepting_output(&self) {}

    fn start_intercepting_output_and_forward_to(&self, client: Arc<dyn ParallelClient>) {
        self.forwards.fetch_add(1, Ordering::SeqCst);
        client.write_output(self.output.as_bytes()).unwrap();
    }

    fn stop_intercepting_and_return_output(&self) -> String {
        self.output.clone()
    }
}

/// A suite already in the run phase, for driving executor pieces directly
pub(crate) fn running_suite_with(collaborators: Collaborators, config: SuiteConfig) -> Suite {
    let mut suite = Suite::new();
    suite.shared.set_phase(Phase::Run);
    suite.shared.set_writer(Arc::clone(&collaborators.writer));
    suite.collaborators = collaborators;
    suite.config = config;
    suite
}

pub(crate) fn running_suite(config: SuiteConfig) -> (Suite, Arc<RecordingReporter>) {
    let reporter = Arc::new(RecordingReporter::default());
    let suite = running_suite_with(
        Collaborators::default().with_reporter(reporter.clone()),
        config,
    );
    (suite, reporter)
}

/// Run a built suite with default collaborators and `reporter`
pub(crate) async fn run_suite(
    suite: &mut Suite,
    reporter: Arc<RecordingReporter>,
    config: SuiteConfig,
) -> bool {
    let collaborators = Collaborators::default().with_reporter(reporter);
    suite.run("test suite", "/tmp/suite", collaborators, config).await
}
