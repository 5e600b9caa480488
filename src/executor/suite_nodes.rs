//! Suite-level node orchestration
//!
//! Adapts before-suite, after-suite, their synchronized variants, suite
//! cleanup and report-after-suite nodes into [`Suite::run_node`] calls,
//! adding the cross-process coordination each kind needs.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

use super::progress::elapsed;
use crate::models::{Node, NodeBody, NodeType, Report, SpecState};
use crate::suite::{Suite, SuiteError};

impl Suite {
    fn writer_output(&self) -> String {
        String::from_utf8_lossy(&self.collaborators.writer.bytes()).into_owned()
    }

    /// Stop capturing and keep what was captured so far on the current report
    fn flush_intercepted_output(&self) {
        let output = self
            .collaborators
            .output_interceptor
            .stop_intercepting_and_return_output();
        self.update_current_spec_report(|r| r.captured_std_out_err.push_str(&output));
    }

    /// Restart capture, forwarding output live to the parallel client
    fn forward_output_to_client(&self) {
        let interceptor = &self.collaborators.output_interceptor;
        match self.client() {
            Ok(client) => interceptor.start_intercepting_output_and_forward_to(client),
            Err(_) => interceptor.start_intercepting_output(),
        }
    }

    async fn run_and_record(&self, node: &Node) {
        let outcome = self.run_node(node, None, "").await;
        self.record_outcome(outcome);
    }

    /// Run one suite-level node into the current spec report
    pub(crate) async fn run_suite_node(&mut self, mut node: Node) {
        if self.config.dry_run {
            self.update_current_spec_report(|r| r.state = SpecState::Passed);
            return;
        }

        self.collaborators.writer.truncate();
        self.collaborators.output_interceptor.start_intercepting_output();
        let start = Utc::now();
        self.update_current_spec_report(|r| r.start_time = Some(start));

        let parallel = self.is_running_in_parallel();
        let primary = self.config.is_primary_process();
        let mut err: Option<SuiteError> = None;

        match node.node_type {
            NodeType::CleanupAfterSuite => {
                if parallel && primary {
                    if let Err(e) = self.block_until_nonprimary_procs_have_finished().await {
                        err = Some(e.into());
                    }
                }
                if err.is_none() {
                    self.run_and_record(&node).await;
                }
            }
            NodeType::SynchronizedBeforeSuite => {
                if let Some(bodies) = node.synchronized_before_suite.clone() {
                    let mut payload: Option<Vec<u8>> = None;
                    let mut run_all_procs = false;

                    if primary {
                        if parallel {
                            self.flush_intercepted_output();
                            self.forward_output_to_client();
                        }

                        let sink = Arc::new(Mutex::new(None));
                        node.body = Some(bodies.proc1.bind((), Arc::clone(&sink)));
                        self.run_and_record(&node).await;
                        payload = sink.lock().take();
                        let state = self.current_state();

                        if parallel {
                            self.flush_intercepted_output();
                            self.collaborators.output_interceptor.start_intercepting_output();
                            let posted = if state == SpecState::Passed {
                                payload.clone()
                            } else {
                                None
                            };
                            let result = match self.client() {
                                Ok(client) => {
                                    client
                                        .post_synchronized_before_suite_completed(state, posted)
                                        .await
                                }
                                Err(e) => Err(e),
                            };
                            if let Err(e) = result {
                                err = Some(e.into());
                            }
                        }
                        run_all_procs = state == SpecState::Passed && err.is_none();
                    } else {
                        let result = match self.client() {
                            Ok(client) => client.block_until_synchronized_before_suite_data().await,
                            Err(e) => Err(e),
                        };
                        match result {
                            Ok((state, data)) => {
                                debug!("Received before-suite outcome {} from process 1", state);
                                payload = data;
                                match state {
                                    SpecState::Passed => run_all_procs = true,
                                    SpecState::Failed | SpecState::Panicked | SpecState::Timedout => {
                                        err = Some(SuiteError::SynchronizedBeforeSuiteFailedOnProc1)
                                    }
                                    SpecState::Interrupted | SpecState::Aborted | SpecState::Skipped => {
                                        self.update_current_spec_report(|r| r.state = state)
                                    }
                                    _ => {}
                                }
                            }
                            Err(e) => err = Some(e.into()),
                        }
                    }

                    if run_all_procs {
                        node.body = Some(
                            bodies
                                .all_procs
                                .bind(payload.unwrap_or_default(), Arc::new(Mutex::new(None))),
                        );
                        self.run_and_record(&node).await;
                    }
                } else {
                    self.run_and_record(&node).await;
                }
            }
            NodeType::SynchronizedAfterSuite => {
                if let Some(bodies) = node.synchronized_after_suite.clone() {
                    node.body = Some(bodies.all_procs);
                    self.run_and_record(&node).await;

                    if primary {
                        if parallel {
                            if let Err(e) = self.block_until_nonprimary_procs_have_finished().await {
                                err = Some(e.into());
                            }
                        }
                        if err.is_none() {
                            if parallel {
                                self.flush_intercepted_output();
                                self.forward_output_to_client();
                            }
                            node.body = Some(bodies.proc1);
                            let outcome = self.run_node(&node, None, "").await;
                            if self.current_state() == SpecState::Passed {
                                self.record_outcome(outcome);
                            }
                        }
                    }
                } else {
                    self.run_and_record(&node).await;
                }
            }
            _ => self.run_and_record(&node).await,
        }

        if let Some(err) = err {
            warn!("{} failed: {}", node.node_type, err);
            if !self.current_state().is_failure() {
                let failure = Suite::failure_for_leaf_node_with_message(&node, &err.to_string());
                self.record_outcome((SpecState::Failed, failure));
            }
        }

        self.finish_suite_node_report(start, true);
    }

    /// Run a report-after-suite node with the suite report merged across processes
    pub(crate) async fn run_report_after_suite_node(&mut self, mut node: Node, report: Report) {
        self.collaborators.writer.truncate();
        self.collaborators.output_interceptor.start_intercepting_output();
        let start = Utc::now();
        self.update_current_spec_report(|r| r.start_time = Some(start));

        let mut report = report;
        if self.is_running_in_parallel() {
            let aggregated = match self.client() {
                Ok(client) => client.block_until_aggregated_nonprimary_procs_report().await,
                Err(e) => Err(e),
            };
            match aggregated {
                Ok(aggregated) => report = report.add(aggregated),
                Err(e) => {
                    warn!("Failed to aggregate reports from other processes: {}", e);
                    let failure = Suite::failure_for_leaf_node_with_message(&node, &e.to_string());
                    self.record_outcome((SpecState::Failed, failure));
                    self.finish_suite_node_report(start, false);
                    return;
                }
            }
        }

        node.body = node
            .report_after_suite_body
            .clone()
            .map(|f| NodeBody::blocking(move || f(report.clone())));
        let text = node.text.clone();
        let outcome = self.run_node(&node, None, &text).await;
        self.record_outcome(outcome);

        self.finish_suite_node_report(start, false);
    }

    /// Stamp the end time and store the captured output
    ///
    /// With `extend_std_output` the intercepted output is appended to what
    /// earlier flushes already moved onto the report; otherwise it replaces it.
    fn finish_suite_node_report(&self, start: chrono::DateTime<Utc>, extend_std_output: bool) {
        let end = Utc::now();
        let writer_output = self.writer_output();
        let std_output = self
            .collaborators
            .output_interceptor
            .stop_intercepting_and_return_output();
        self.update_current_spec_report(|r| {
            r.end_time = Some(end);
            r.run_time = elapsed(Some(start), end);
            r.captured_writer_output = writer_output;
            if extend_std_output {
                r.captured_std_out_err.push_str(&std_output);
            } else {
                r.captured_std_out_err = std_output;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SuiteConfig;
    use crate::models::{BodyError, DataBody, PayloadBody, SpecReport};
    use crate::parallel::{LocalServer, ParallelClient};
    use crate::suite::Collaborators;
    use crate::test_support::{running_suite, running_suite_with, ScriptedInterceptor};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn begin(suite: &Suite, node: &Node) {
        suite.begin_spec_report(SpecReport::for_node(
            node.node_type,
            node.code_location.clone(),
            "",
            suite.config().parallel_process,
        ));
    }

    #[tokio::test]
    async fn test_dry_run_passes_without_running() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let (mut suite, _) = running_suite(SuiteConfig::default().dry_run(true));
        let node = Node::before_suite(NodeBody::blocking(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        begin(&suite, &node);
        suite.run_suite_node(node).await;
        assert_eq!(suite.current_state(), SpecState::Passed);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_synchronized_before_suite_single_process() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let (mut suite, _) = running_suite(SuiteConfig::default());
        let node = Node::synchronized_before_suite(
            DataBody::blocking(|| Ok(b"db-url".to_vec())),
            PayloadBody::blocking(move |data| {
                *sink.lock() = data;
                Ok(())
            }),
        );
        begin(&suite, &node);
        suite.run_suite_node(node).await;

        let report = suite.current_spec_report();
        assert_eq!(report.state, SpecState::Passed);
        assert!(report.end_time.is_some());
        assert_eq!(*received.lock(), b"db-url".to_vec());
    }

    #[tokio::test]
    async fn test_synchronized_before_suite_failure_skips_all_procs_body() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let (mut suite, _) = running_suite(SuiteConfig::default());
        let node = Node::synchronized_before_suite(
            DataBody::blocking(|| Err(BodyError::fail("no database"))),
            PayloadBody::blocking(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        begin(&suite, &node);
        suite.run_suite_node(node).await;

        assert_eq!(suite.current_state(), SpecState::Failed);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_secondary_reports_proc1_failure() {
        let server = LocalServer::new(2);
        server
            .client(1)
            .unwrap()
            .post_synchronized_before_suite_completed(SpecState::Panicked, None)
            .await
            .unwrap();

        let client = Arc::new(server.client(2).unwrap());
        let mut suite = running_suite_with(
            Collaborators::default().with_client(client),
            SuiteConfig::default().with_parallel(2, 2),
        );
        let node = Node::synchronized_before_suite(
            DataBody::blocking(|| Ok(Vec::new())),
            PayloadBody::blocking(|_| Ok(())),
        );
        begin(&suite, &node);
        suite.run_suite_node(node).await;

        let report = suite.current_spec_report();
        assert_eq!(report.state, SpecState::Failed);
        assert_eq!(report.failure.message, "SynchronizedBeforeSuite failed on proc 1");
    }

    #[tokio::test]
    async fn test_secondary_propagates_proc1_skip() {
        let server = LocalServer::new(2);
        server
            .client(1)
            .unwrap()
            .post_synchronized_before_suite_completed(SpecState::Skipped, None)
            .await
            .unwrap();

        let client = Arc::new(server.client(2).unwrap());
        let mut suite = running_suite_with(
            Collaborators::default().with_client(client),
            SuiteConfig::default().with_parallel(2, 2),
        );
        let node = Node::synchronized_before_suite(
            DataBody::blocking(|| Ok(Vec::new())),
            PayloadBody::blocking(|_| Ok(())),
        );
        begin(&suite, &node);
        suite.run_suite_node(node).await;
        assert_eq!(suite.current_state(), SpecState::Skipped);
    }

    #[tokio::test]
    async fn test_synchronized_after_suite_keeps_first_failure() {
        let (mut suite, _) = running_suite(SuiteConfig::default());
        let node = Node::synchronized_after_suite(
            NodeBody::blocking(|| Err(BodyError::fail("all procs"))),
            NodeBody::blocking(|| Err(BodyError::fail("proc 1"))),
        );
        begin(&suite, &node);
        suite.run_suite_node(node).await;

        let report = suite.current_spec_report();
        assert_eq!(report.state, SpecState::Failed);
        assert_eq!(report.failure.message, "all procs");
    }

    #[tokio::test]
    async fn test_missing_client_fails_cleanup_in_parallel() {
        let mut suite = running_suite_with(
            Collaborators::default(),
            SuiteConfig::default().with_parallel(1, 2),
        );
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let mut node = Node::cleanup(NodeBody::blocking(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        node.node_type = NodeType::CleanupAfterSuite;
        begin(&suite, &node);
        suite.run_suite_node(node).await;

        let report = suite.current_spec_report();
        assert_eq!(report.state, SpecState::Failed);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_report_after_suite_receives_report() {
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = seen.clone();
        let (mut suite, _) = running_suite(SuiteConfig::default());
        let node = Node::report_after_suite("summary", move |report| {
            *sink.lock() = report.suite_description;
            Ok(())
        });
        begin(&suite, &node);
        let report = Report {
            suite_description: "cache suite".into(),
            ..Default::default()
        };
        suite.run_report_after_suite_node(node, report).await;

        assert_eq!(suite.current_state(), SpecState::Passed);
        assert_eq!(*seen.lock(), "cache suite");
    }

    #[tokio::test]
    async fn test_report_after_suite_replaces_captured_std_output() {
        let interceptor = Arc::new(ScriptedInterceptor::returning("summary printed\n"));
        let mut suite = running_suite_with(
            Collaborators::default().with_output_interceptor(interceptor),
            SuiteConfig::default(),
        );
        let node = Node::report_after_suite("summary", |_report| Ok(()));
        begin(&suite, &node);
        suite.update_current_spec_report(|r| r.captured_std_out_err = "stale\n".into());

        suite.run_report_after_suite_node(node, Report::default()).await;
        assert_eq!(
            suite.current_spec_report().captured_std_out_err,
            "summary printed\n"
        );
    }

    #[tokio::test]
    async fn test_suite_node_appends_captured_std_output() {
        let interceptor = Arc::new(ScriptedInterceptor::returning("setup log\n"));
        let mut suite = running_suite_with(
            Collaborators::default().with_output_interceptor(interceptor),
            SuiteConfig::default(),
        );
        let node = Node::before_suite(NodeBody::blocking(|| Ok(())));
        begin(&suite, &node);
        suite.update_current_spec_report(|r| r.captured_std_out_err = "earlier\n".into());

        suite.run_suite_node(node).await;
        assert_eq!(
            suite.current_spec_report().captured_std_out_err,
            "earlier\nsetup log\n"
        );
    }
}
