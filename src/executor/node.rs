//! Node execution
//!
//! [`Suite::run_node`] runs exactly one node body on its own worker and races
//! it against the node's deadline, interrupts and the progress poller. The
//! body is never joined: once its grace period runs out it is left running
//! in the background and the executor moves on.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant, Sleep};
use tracing::{debug, warn};

use super::worker::{panicked, spawn_body, Outcome};
use crate::context::SpecContext;
use crate::interrupt::InterruptLevel;
use crate::models::{Failure, FailureNodeContext, Node, NodeBody, NodeType, SpecState};
use crate::suite::Suite;

const TIMED_OUT_THEN_FAILED: &str =
    "This spec timed out and reported the following failure after the timeout:\n\n";
const TIMEOUT_REPORT: &str = "This is the Progress Report generated when the timeout occurred:";
const INTERRUPT_REPORT: &str =
    "This is the Progress Report generated when the interrupt was received:";
const LEAKED_NODE: &str = "A running node failed to exit in time\n\
Moving on, but a node has timed out and failed to exit before its grace period elapsed.  \
The node has now leaked and is running in the background.\n\
Here's a current progress report:";
const POLLING: &str = "Automatically polling progress:";
const REQUESTED: &str = "You've requested a progress report:";

type Timer = Option<Pin<Box<Sleep>>>;

/// Resolves when the timer fires; never resolves when it is disarmed
async fn fire(timer: &mut Timer) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

fn skipped() -> Outcome {
    (SpecState::Skipped, Failure::default())
}

fn failure_node_context(node: &Node) -> FailureNodeContext {
    if node.node_type == NodeType::It || node.node_type.is_suite_level() {
        FailureNodeContext::LeafNode
    } else if node.nesting_level <= 0 {
        FailureNodeContext::TopLevel
    } else {
        FailureNodeContext::InContainer {
            container_index: node.nesting_level - 1,
        }
    }
}

/// A `Some(0)` override turns polling off for the node
fn poll_setting(node_value: Option<Duration>, suite_value: Option<Duration>) -> Option<Duration> {
    match node_value {
        Some(value) if value.is_zero() => None,
        Some(value) => Some(value),
        None => suite_value,
    }
}

impl Suite {
    /// Run one node and return its terminal state and failure
    ///
    /// `spec_deadline` is the deadline of the spec the node belongs to, if
    /// any. `text` is shown in spec progress output.
    pub async fn run_node(&self, node: &Node, spec_deadline: Option<Instant>, text: &str) -> Outcome {
        if node.node_type.is_cleanup() {
            self.shared.remove_cleanup_node(node);
        }

        let mut status = self.interrupt_status();
        let node_type = node.node_type;
        match status.level {
            InterruptLevel::BailOut => return skipped(),
            InterruptLevel::ReportOnly if !node_type.allowed_during_report_interrupt() => {
                return skipped()
            }
            InterruptLevel::CleanupAndReport
                if !(node_type.allowed_during_report_interrupt()
                    || node_type.allowed_during_cleanup_interrupt()) =>
            {
                return skipped()
            }
            _ => {}
        }

        let _cursor = self.shared.enter_node(node);

        if self.config.emit_spec_progress && !node.marked_suppress_progress_reporting {
            let text = if text.is_empty() { "TOP-LEVEL" } else { text };
            let line = format!("[{}] {}\n  {}\n", node_type, text, node.code_location);
            self.collaborators.writer.write(line.as_bytes());
        }

        let mut failure = Failure {
            failure_node_type: Some(node_type),
            failure_node_location: node.code_location.clone(),
            failure_node_context: failure_node_context(node),
            ..Default::default()
        };
        let mut outcome = SpecState::Invalid;

        let mut grace_period = node
            .grace_period
            .unwrap_or_else(|| self.config.grace_period());
        let node_timeout = node.node_timeout.filter(|t| !t.is_zero());

        let now = Instant::now();
        let mut deadline = self.deadline;
        if let Some(spec_deadline) = spec_deadline {
            if deadline.map_or(true, |d| spec_deadline < d) {
                deadline = Some(spec_deadline);
            }
        }
        if let Some(timeout) = node_timeout {
            if deadline.map_or(true, |d| d.saturating_duration_since(now) > timeout) {
                deadline = Some(now + timeout);
            }
        }
        if deadline.is_some_and(|d| d < now) || status.interrupted() {
            // Out of time already: one last window to exit cleanly.
            deadline = Some(now + node_timeout.unwrap_or(grace_period));
        }

        let has_context = node.has_context();
        if !has_context {
            grace_period = Duration::ZERO;
        }

        let ctx = SpecContext::new(Arc::downgrade(&self.shared));
        let _cancel_on_exit = ctx.token().drop_guard();
        self.shared.set_current_spec_context(ctx.clone());

        let body = node
            .body
            .clone()
            .unwrap_or_else(|| NodeBody::blocking(|| Ok(())));
        let mut completion = spawn_body(body, ctx.clone());

        let poll_after = poll_setting(node.poll_progress_after, self.config.poll_progress_after());
        let poll_interval = poll_setting(
            node.poll_progress_interval,
            self.config.poll_progress_interval(),
        );

        let mut deadline_timer: Timer = deadline.map(|d| Box::pin(sleep_until(d)));
        let mut grace_timer: Timer = None;
        let mut poll_timer: Timer = poll_after.map(|d| Box::pin(sleep(d)));

        loop {
            tokio::select! {
                biased;

                result = &mut completion => {
                    let (state, run_failure) = result.unwrap_or_else(|_| panicked(None));
                    if outcome == SpecState::Interrupted {
                        debug!("{} exited after the interrupt", node_type);
                        return (outcome, failure);
                    }
                    if outcome == SpecState::Timedout {
                        if state != SpecState::Passed {
                            failure.location = run_failure.location;
                            failure.forwarded_panic = run_failure.forwarded_panic;
                            failure.message = format!("{TIMED_OUT_THEN_FAILED}{}", run_failure.message);
                        }
                        return (outcome, failure);
                    }
                    if state == SpecState::Passed {
                        return (state, Failure::default());
                    }
                    failure.message = run_failure.message;
                    failure.location = run_failure.location;
                    failure.forwarded_panic = run_failure.forwarded_panic;
                    return (state, failure);
                }

                _ = fire(&mut grace_timer) => {
                    if has_context && outcome == SpecState::Timedout {
                        warn!("{} at {} leaked after its grace period", node_type, node.code_location);
                        let report = self.generate_progress_report().with_message(LEAKED_NODE);
                        self.emit_progress_report(report).await;
                    }
                    return (outcome, failure);
                }

                _ = fire(&mut deadline_timer) => {
                    warn!("{} at {} timed out", node_type, node.code_location);
                    outcome = SpecState::Timedout;
                    failure.message = "Timedout".to_string();
                    failure.location = node.code_location.clone();
                    // Capture before cancelling so the report shows where the node is stuck.
                    failure.progress_report = Some(
                        self.generate_progress_report()
                            .without_captured_writer_output()
                            .with_message(TIMEOUT_REPORT),
                    );
                    deadline_timer = None;
                    ctx.cancel();
                    grace_timer = Some(Box::pin(sleep(grace_period)));
                }

                _ = status.channel.cancelled() => {
                    status = self.interrupt_status();
                    deadline_timer = None;
                    let include_report = status.should_include_progress_report();
                    warn!(level = ?status.level, "{} interrupted: {}", node_type, status.message());

                    if outcome == SpecState::Invalid {
                        outcome = SpecState::Interrupted;
                        failure.message = status.message();
                        failure.location = node.code_location.clone();
                        if include_report {
                            failure.progress_report = Some(
                                self.generate_progress_report()
                                    .without_captured_writer_output()
                                    .with_message(INTERRUPT_REPORT),
                            );
                        }
                    }

                    let report = include_report.then(|| self.generate_progress_report());
                    ctx.cancel();

                    if status.level == InterruptLevel::BailOut {
                        if let Some(report) = report {
                            let message = format!(
                                "{}\nFinal interrupt received; no cleanup or reporting nodes will run and the suite will terminate as soon as possible.\nHere's a current progress report:",
                                status.message()
                            );
                            self.emit_progress_report(report.with_message(message)).await;
                        }
                        return (outcome, failure);
                    }

                    if let Some(report) = report {
                        let message = match status.level {
                            InterruptLevel::CleanupAndReport => format!(
                                "{}\nFirst interrupt received; cleanup and reporting nodes will run but all remaining specs will be skipped.  Interrupt again to skip cleanup.\nHere's a current progress report:",
                                status.message()
                            ),
                            InterruptLevel::ReportOnly => format!(
                                "{}\nSecond interrupt received; reporting nodes will run but all remaining specs and cleanup nodes will be skipped.  Interrupt again to bail immediately.\nHere's a current progress report:",
                                status.message()
                            ),
                            _ => String::new(),
                        };
                        self.emit_progress_report(report.with_message(message)).await;
                    }

                    if grace_timer.is_some() {
                        return (outcome, failure);
                    }
                    grace_timer = Some(Box::pin(sleep(grace_period)));
                }

                _ = self.collaborators.progress_signal.requested() => {
                    let report = self.generate_progress_report().with_message(REQUESTED);
                    self.emit_progress_report(report).await;
                }

                _ = fire(&mut poll_timer) => {
                    let report = self.generate_progress_report().with_message(POLLING);
                    self.emit_progress_report(report).await;
                    poll_timer = poll_interval.map(|d| Box::pin(sleep(d)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SuiteConfig;
    use crate::interrupt::{InterruptCause, InterruptHandler, ProgressSignal};
    use crate::models::BodyError;
    use crate::output::{BufferedWriter, Writer};
    use crate::suite::Collaborators;
    use crate::test_support::{running_suite, running_suite_with, RecordingReporter};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn slow_config() -> SuiteConfig {
        SuiteConfig::default().with_grace_period(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_passing_node() {
        let (suite, _) = running_suite(SuiteConfig::default());
        let node = Node::it("passes", NodeBody::blocking(|| Ok(())));
        let (state, failure) = suite.run_node(&node, None, "passes").await;
        assert_eq!(state, SpecState::Passed);
        assert!(failure.is_zero());
    }

    #[tokio::test]
    async fn test_failure_carries_node_context() {
        let (suite, _) = running_suite(SuiteConfig::default());
        let mut node = Node::after_each(NodeBody::blocking(|| Err(BodyError::fail("teardown"))));
        node.nesting_level = 2;
        let (state, failure) = suite.run_node(&node, None, "").await;
        assert_eq!(state, SpecState::Failed);
        assert_eq!(failure.message, "teardown");
        assert_eq!(failure.failure_node_type, Some(NodeType::AfterEach));
        assert_eq!(
            failure.failure_node_context,
            FailureNodeContext::InContainer { container_index: 1 }
        );
    }

    #[tokio::test]
    async fn test_panic_becomes_panicked() {
        let (suite, _) = running_suite(SuiteConfig::default());
        let node = Node::it("explodes", NodeBody::blocking(|| panic!("index out of range")));
        let (state, failure) = suite.run_node(&node, None, "").await;
        assert_eq!(state, SpecState::Panicked);
        assert_eq!(failure.message, "Test Panicked");
        assert_eq!(failure.forwarded_panic.as_deref(), Some("index out of range"));
        assert_eq!(failure.failure_node_context, FailureNodeContext::LeafNode);
    }

    #[tokio::test]
    async fn test_context_less_body_is_abandoned_after_timeout() {
        let (suite, reporter) = running_suite(slow_config());
        let node = Node::it(
            "stuck",
            NodeBody::blocking(|| {
                std::thread::sleep(Duration::from_millis(1500));
                Ok(())
            }),
        )
        .with_node_timeout(Duration::from_millis(20));

        let start = std::time::Instant::now();
        let (state, failure) = suite.run_node(&node, None, "").await;
        assert_eq!(state, SpecState::Timedout);
        assert_eq!(failure.message, "Timedout");
        assert!(start.elapsed() < Duration::from_millis(1000));
        let report = failure.progress_report.unwrap();
        assert_eq!(report.message, TIMEOUT_REPORT);
        assert!(reporter.progress_reports().is_empty());
    }

    #[tokio::test]
    async fn test_late_failure_after_timeout_is_appended() {
        let (suite, reporter) = running_suite(slow_config());
        let node = Node::it(
            "cancellable",
            NodeBody::blocking_with_context(|ctx| {
                while !ctx.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(BodyError::fail("connection reset"))
            }),
        )
        .with_node_timeout(Duration::from_millis(10));

        let start = std::time::Instant::now();
        let (state, failure) = suite.run_node(&node, None, "").await;
        assert_eq!(state, SpecState::Timedout);
        assert_eq!(
            failure.message,
            format!("{TIMED_OUT_THEN_FAILED}connection reset")
        );
        assert!(failure.location.file_name.ends_with("node.rs"));
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert!(start.elapsed() < Duration::from_millis(1000));
        assert!(reporter.progress_reports().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_then_clean_exit_stays_timedout() {
        let (suite, _) = running_suite(slow_config());
        let node = Node::it(
            "cooperative",
            NodeBody::from_async(|ctx| async move {
                ctx.cancelled().await;
                Ok(())
            }),
        )
        .with_node_timeout(Duration::from_millis(10));

        let (state, failure) = suite.run_node(&node, None, "").await;
        assert_eq!(state, SpecState::Timedout);
        assert_eq!(failure.message, "Timedout");
    }

    #[tokio::test]
    async fn test_leaked_node_reports_after_grace_period() {
        let config = SuiteConfig::default().with_grace_period(Duration::from_millis(20));
        let (suite, reporter) = running_suite(config);
        let node = Node::it(
            "ignores cancellation",
            NodeBody::blocking_with_context(|_ctx| {
                std::thread::sleep(Duration::from_millis(1500));
                Ok(())
            }),
        )
        .with_node_timeout(Duration::from_millis(10));

        let (state, _) = suite.run_node(&node, None, "").await;
        assert_eq!(state, SpecState::Timedout);
        let reports = reporter.progress_reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].message.starts_with("A running node failed to exit in time"));
    }

    #[tokio::test]
    async fn test_spec_deadline_applies() {
        let (suite, _) = running_suite(slow_config());
        let node = Node::it(
            "slow",
            NodeBody::from_async(|ctx| async move {
                ctx.cancelled().await;
                Ok(())
            }),
        );
        let deadline = Instant::now() + Duration::from_millis(15);
        let (state, _) = suite.run_node(&node, Some(deadline), "").await;
        assert_eq!(state, SpecState::Timedout);
    }

    #[tokio::test]
    async fn test_interrupt_wins_over_late_completion() {
        let handler = Arc::new(InterruptHandler::new());
        let reporter = Arc::new(RecordingReporter::default());
        let suite = running_suite_with(
            Collaborators::default()
                .with_reporter(reporter.clone())
                .with_interrupt_source(handler.clone()),
            slow_config(),
        );

        let trigger = handler.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.interrupt(InterruptCause::Signal);
        });

        let node = Node::it(
            "waits",
            NodeBody::from_async(|ctx| async move {
                ctx.cancelled().await;
                Err(BodyError::fail("cancelled"))
            }),
        );
        let (state, failure) = suite.run_node(&node, None, "").await;
        assert_eq!(state, SpecState::Interrupted);
        assert_eq!(failure.message, "Interrupted by User");
        assert_eq!(
            failure.progress_report.map(|r| r.message).as_deref(),
            Some(INTERRUPT_REPORT)
        );
        let reports = reporter.progress_reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].message.contains("First interrupt received"));
    }

    #[tokio::test]
    async fn test_second_interrupt_ends_grace_period() {
        let handler = Arc::new(InterruptHandler::new());
        let suite = running_suite_with(
            Collaborators::default().with_interrupt_source(handler.clone()),
            slow_config(),
        );

        let trigger = handler.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.interrupt(InterruptCause::Signal);
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.interrupt(InterruptCause::Signal);
        });

        let node = Node::it(
            "ignores cancellation",
            NodeBody::blocking_with_context(|_ctx| {
                std::thread::sleep(Duration::from_millis(2000));
                Ok(())
            }),
        );
        let start = std::time::Instant::now();
        let (state, _) = suite.run_node(&node, None, "").await;
        assert_eq!(state, SpecState::Interrupted);
        assert!(start.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_interrupt_levels_gate_node_types() {
        let handler = Arc::new(InterruptHandler::new());
        let suite = running_suite_with(
            Collaborators::default().with_interrupt_source(handler.clone()),
            SuiteConfig::default(),
        );
        let ran = Arc::new(AtomicUsize::new(0));
        let body = || {
            let ran = ran.clone();
            NodeBody::blocking(move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        handler.interrupt(InterruptCause::Signal);
        let (state, _) = suite.run_node(&Node::it("spec", body()), None, "").await;
        assert_eq!(state, SpecState::Skipped);
        let (state, _) = suite.run_node(&Node::after_each(body()), None, "").await;
        assert_eq!(state, SpecState::Passed);

        handler.interrupt(InterruptCause::Signal);
        let (state, _) = suite.run_node(&Node::after_each(body()), None, "").await;
        assert_eq!(state, SpecState::Skipped);

        handler.interrupt(InterruptCause::Signal);
        let report = Node::report_after_each(|_| Ok(()));
        let (state, _) = suite.run_node(&report, None, "").await;
        assert_eq!(state, SpecState::Skipped);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleanup_node_removed_before_it_runs() {
        let (suite, _) = running_suite(SuiteConfig::default());
        let leaf = Node::it("leaf", NodeBody::blocking(|| Ok(())));
        {
            let _guard = suite.shared.enter_node(&leaf);
            suite
                .handle()
                .defer_cleanup(NodeBody::blocking(|| Ok(())))
                .unwrap();
        }
        let cleanup = suite.cleanup_nodes_with_type(NodeType::CleanupAfterEach).remove(0);

        let (state, _) = suite.run_node(&cleanup, None, "").await;
        assert_eq!(state, SpecState::Passed);
        assert!(suite.cleanup_nodes_with_type(NodeType::CleanupAfterEach).is_empty());
    }

    #[tokio::test]
    async fn test_spec_progress_written_to_writer() {
        let writer = Arc::new(BufferedWriter::new());
        let suite = running_suite_with(
            Collaborators::default().with_writer(writer.clone()),
            SuiteConfig::default().emit_spec_progress(true),
        );
        let node = Node::before_suite(NodeBody::blocking(|| Ok(())));
        suite.run_node(&node, None, "").await;
        let quiet = Node::it("quiet", NodeBody::blocking(|| Ok(()))).suppress_progress_reporting();
        suite.run_node(&quiet, None, "quiet").await;

        let output = String::from_utf8(writer.bytes()).unwrap();
        assert!(output.starts_with("[BeforeSuite] TOP-LEVEL\n  "));
        assert!(!output.contains("quiet"));
    }

    #[tokio::test]
    async fn test_progress_polling() {
        let config = SuiteConfig::default().with_poll_progress(Duration::from_millis(20), None);
        let (suite, reporter) = running_suite(config);
        let node = Node::it(
            "slow",
            NodeBody::blocking(|| {
                std::thread::sleep(Duration::from_millis(150));
                Ok(())
            }),
        );
        let (state, _) = suite.run_node(&node, None, "").await;
        assert_eq!(state, SpecState::Passed);
        let reports = reporter.progress_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].message, POLLING);
        assert_eq!(reports[0].current_node_text, "slow");

        let silenced = node.clone().with_poll_progress_after(Duration::ZERO);
        suite.run_node(&silenced, None, "").await;
        assert_eq!(reporter.progress_reports().len(), 1);
    }

    #[tokio::test]
    async fn test_progress_poll_reschedules_at_interval() {
        let config = SuiteConfig::default().with_poll_progress(
            Duration::from_millis(20),
            Some(Duration::from_millis(20)),
        );
        let (suite, reporter) = running_suite(config);
        let node = Node::it(
            "slow",
            NodeBody::blocking(|| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            }),
        );
        let (state, _) = suite.run_node(&node, None, "").await;
        assert_eq!(state, SpecState::Passed);

        let reports = reporter.progress_reports();
        assert!(reports.len() >= 3, "only {} polls", reports.len());
        assert!(reports.iter().all(|r| r.message == POLLING));
        assert_eq!(
            suite.current_spec_report().progress_reports.len(),
            reports.len()
        );
    }

    #[tokio::test]
    async fn test_bail_out_returns_without_grace() {
        let handler = Arc::new(InterruptHandler::new());
        let reporter = Arc::new(RecordingReporter::default());
        let suite = running_suite_with(
            Collaborators::default()
                .with_reporter(reporter.clone())
                .with_interrupt_source(handler.clone()),
            slow_config(),
        );

        let trigger = handler.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            for _ in 0..3 {
                trigger.interrupt(InterruptCause::Signal);
            }
        });

        let node = Node::it(
            "ignores cancellation",
            NodeBody::blocking_with_context(|_ctx| {
                std::thread::sleep(Duration::from_millis(2000));
                Ok(())
            }),
        );
        let start = std::time::Instant::now();
        let (state, failure) = suite.run_node(&node, None, "").await;
        assert_eq!(state, SpecState::Interrupted);
        assert_eq!(failure.message, "Interrupted by User");
        assert!(start.elapsed() < Duration::from_millis(1000));

        let reports = reporter.progress_reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].message.contains("Final interrupt received"));
    }

    #[tokio::test]
    async fn test_requested_progress_report() {
        let signal = Arc::new(ProgressSignal::new());
        let reporter = Arc::new(RecordingReporter::default());
        let suite = running_suite_with(
            Collaborators::default()
                .with_reporter(reporter.clone())
                .with_progress_signal(signal.clone()),
            SuiteConfig::default(),
        );

        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.request();
        });

        let node = Node::it(
            "slow",
            NodeBody::blocking(|| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            }),
        );
        let (state, _) = suite.run_node(&node, None, "").await;
        assert_eq!(state, SpecState::Passed);

        let reports = reporter.progress_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].message, REQUESTED);
        assert_eq!(reports[0].current_node_text, "slow");
    }
}
