//! Progress reports and spec report bookkeeping

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::{
    Failure, FailureNodeContext, Node, NodeBody, NodeType, ProgressReport, Spec, SpecReport,
    SpecState,
};
use crate::suite::Suite;

/// Time between `start` and `end`, zero when unknown or negative
pub(crate) fn elapsed(start: Option<DateTime<Utc>>, end: DateTime<Utc>) -> Duration {
    start
        .and_then(|start| (end - start).to_std().ok())
        .unwrap_or_default()
}

impl Suite {
    /// Snapshot of what the running node is doing right now
    pub fn generate_progress_report(&self) -> ProgressReport {
        let snapshot = self.shared.progress_snapshot();
        // Reporters run user code, so query them after the lock is released.
        let additional_reports = snapshot
            .context
            .map(|ctx| ctx.query_progress_reporters())
            .unwrap_or_default();
        // Output already moved onto the spec report comes first.
        let mut captured_writer_output = snapshot.report.captured_writer_output.clone();
        captured_writer_output.push_str(&String::from_utf8_lossy(&self.collaborators.writer.bytes()));
        let node = snapshot.node;

        ProgressReport {
            message: String::new(),
            parallel_process: self.config.parallel_process,
            running_in_parallel: self.is_running_in_parallel(),
            container_hierarchy_texts: snapshot.report.container_hierarchy_texts,
            leaf_node_text: snapshot.report.leaf_node_text,
            leaf_node_location: snapshot.report.leaf_node_location,
            spec_start_time: snapshot.report.start_time,
            current_node_type: node.as_ref().map(|n| n.node_type),
            current_node_text: node.as_ref().map(|n| n.text.clone()).unwrap_or_default(),
            current_node_location: node.map(|n| n.code_location).unwrap_or_default(),
            current_node_start_time: snapshot.node_start_time,
            current_step_text: snapshot.step.text,
            current_step_location: snapshot.step.location,
            current_step_start_time: snapshot.step.start_time,
            captured_writer_output,
            additional_reports,
        }
    }

    /// Record `report` on the current spec and forward it to the reporter
    pub async fn emit_progress_report(&self, report: ProgressReport) {
        let recorded = report.clone().without_captured_writer_output();
        self.shared
            .update_current_spec_report(|r| r.progress_reports.push(recorded));

        self.collaborators.reporter.emit_progress_report(&report);
        if let Some(client) = self.parallel_client() {
            if let Err(e) = client.post_emit_progress_report(&report).await {
                warn!("Failed to post progress report: {}", e);
            }
        }
    }

    /// Hand the current spec report to the reporter and append it to the suite report
    pub async fn process_current_spec_report(&mut self) {
        let report = self.shared.recorded_spec_report();
        self.collaborators.reporter.did_run(&report);
        if let Some(client) = self.parallel_client() {
            if let Err(e) = client.post_did_run(&report).await {
                warn!("Failed to post spec report: {}", e);
            }
        }

        let state = report.state;
        self.report.spec_reports.push(report);

        if state.is_failure() {
            self.report.suite_succeeded = false;
            if self.config.fail_fast || state == SpecState::Aborted {
                debug!("Skipping remaining specs after {}", state);
                self.skip_all = true;
                if let Some(client) = self.parallel_client() {
                    if let Err(e) = client.post_abort().await {
                        warn!("Failed to post abort: {}", e);
                    }
                }
            }
        }
    }

    /// Replace the current spec report
    pub fn begin_spec_report(&self, report: SpecReport) {
        self.shared.set_current_spec_report(report);
    }

    /// The current spec report as recorded so far
    pub fn current_spec_report(&self) -> SpecReport {
        self.shared.recorded_spec_report()
    }

    pub fn update_current_spec_report<R>(&self, f: impl FnOnce(&mut SpecReport) -> R) -> R {
        self.shared.update_current_spec_report(f)
    }

    pub fn current_state(&self) -> SpecState {
        self.shared.update_current_spec_report(|r| r.state)
    }

    /// Store a node outcome as the current spec's state and failure
    pub fn record_outcome(&self, (state, failure): (SpecState, Failure)) {
        self.shared.update_current_spec_report(|r| {
            r.state = state;
            r.failure = failure;
        });
    }

    /// Pending cleanup nodes of `node_type` in registration order
    pub fn cleanup_nodes_with_type(&self, node_type: NodeType) -> Vec<Node> {
        self.shared.cleanup_nodes_with_type(node_type)
    }

    /// Failure attributed to `node` that did not come from its body
    pub fn failure_for_leaf_node_with_message(node: &Node, message: &str) -> Failure {
        Failure {
            message: message.to_string(),
            location: node.code_location.clone(),
            failure_node_context: FailureNodeContext::LeafNode,
            failure_node_type: Some(node.node_type),
            failure_node_location: node.code_location.clone(),
            ..Default::default()
        }
    }

    /// Run the spec's report-before-each or report-after-each nodes
    ///
    /// Before-each nodes run outermost first, after-each nodes innermost
    /// first. A reporting node's failure only replaces the spec's outcome
    /// when the spec had not already failed.
    pub async fn report_each(&mut self, spec: &Spec, node_type: NodeType) {
        let mut nodes = spec.nodes_with_type(node_type);
        if node_type == NodeType::ReportAfterEach {
            nodes.sort_by_key(|n| std::cmp::Reverse(n.nesting_level));
        } else {
            nodes.sort_by_key(|n| n.nesting_level);
        }

        let writer = self.collaborators.writer.clone();
        let interceptor = self.collaborators.output_interceptor.clone();
        for mut node in nodes {
            writer.truncate();
            interceptor.start_intercepting_output();

            let report = self.current_spec_report();
            node.body = node
                .report_each_body
                .clone()
                .map(|f| NodeBody::blocking(move || f(report.clone())));
            let text = spec.best_text_for(&node);
            let (state, failure) = self.run_node(&node, None, &text).await;

            let current = self.current_state();
            if (!current.is_failure() && state.is_failure()) || state == SpecState::Aborted {
                self.record_outcome((state, failure));
            }

            let writer_output = String::from_utf8_lossy(&writer.bytes()).into_owned();
            let std_output = interceptor.stop_intercepting_and_return_output();
            self.update_current_spec_report(|r| {
                r.captured_writer_output.push_str(&writer_output);
                r.captured_std_out_err.push_str(&std_output);
            });
        }
    }
}
