//! Reporter collaborators
//!
//! Sinks for suite lifecycle events. Reporters are called synchronously from
//! the controlling flow and must return quickly.

use tracing::{debug, error, info, warn};

use crate::models::{ProgressReport, Report, SpecReport, SpecState};
use crate::output::{OutputFormat, ReportFormatter};

/// Sink for lifecycle events
pub trait Reporter: Send + Sync {
    fn suite_will_begin(&self, report: &Report);
    fn will_run(&self, report: &SpecReport);
    fn did_run(&self, report: &SpecReport);
    fn emit_progress_report(&self, report: &ProgressReport);
    fn suite_did_end(&self, report: &Report);
}

/// Reporter that discards every event
#[derive(Debug, Default)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn suite_will_begin(&self, _report: &Report) {}
    fn will_run(&self, _report: &SpecReport) {}
    fn did_run(&self, _report: &SpecReport) {}
    fn emit_progress_report(&self, _report: &ProgressReport) {}
    fn suite_did_end(&self, _report: &Report) {}
}

/// Reporter that logs every event through `tracing`
pub struct TracingReporter {
    formatter: ReportFormatter,
}

impl TracingReporter {
    pub fn new() -> Self {
        Self {
            formatter: ReportFormatter::new(OutputFormat::Summary).no_color(),
        }
    }

    pub fn with_formatter(formatter: ReportFormatter) -> Self {
        Self { formatter }
    }
}

impl Default for TracingReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for TracingReporter {
    fn suite_will_begin(&self, report: &Report) {
        info!(
            "Running suite {} - {} of {} specs will run",
            report.suite_description,
            report.pre_run_stats.specs_that_will_run,
            report.pre_run_stats.total_specs
        );
    }

    fn will_run(&self, report: &SpecReport) {
        debug!("Starting {}", report.full_text());
    }

    fn did_run(&self, report: &SpecReport) {
        let line = self.formatter.format_spec_report(report);
        match report.state {
            SpecState::Passed | SpecState::Pending | SpecState::Skipped => debug!("{}", line),
            SpecState::Interrupted | SpecState::Timedout => warn!("{}", line),
            _ => error!("{}", line),
        }
    }

    fn emit_progress_report(&self, report: &ProgressReport) {
        info!("{}", report);
    }

    fn suite_did_end(&self, report: &Report) {
        let summary = self.formatter.format_report(report);
        if report.suite_succeeded {
            info!("{}", summary);
        } else {
            for reason in &report.special_suite_failure_reasons {
                warn!("Suite failure: {}", reason);
            }
            error!("{}", summary);
        }
    }
}
