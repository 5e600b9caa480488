//! Suite run loop
//!
//! Drives before-suite nodes, spec groups, after-suite and cleanup nodes and
//! finally the report-after-suite nodes, keeping the aggregate [`Report`]
//! current as each piece finishes.

use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::tree::order_specs;
use super::{Collaborators, Phase, Suite};
use crate::config::SuiteConfig;
use crate::executor::elapsed;
use crate::models::{Node, NodeType, NodesExt, PreRunStats, Report, Spec, SpecReport, SpecState};
use crate::parallel::{ParallelClient, ParallelError};

/// Where the next group index comes from
///
/// A single process walks the groups itself. Cooperating processes share a
/// counter so every group is claimed by exactly one of them.
enum IndexSource {
    Local(usize),
    Client(Arc<dyn ParallelClient>),
}

impl IndexSource {
    async fn next(&mut self) -> Result<usize, ParallelError> {
        match self {
            IndexSource::Local(next) => {
                let idx = *next;
                *next += 1;
                Ok(idx)
            }
            IndexSource::Client(client) => client.fetch_next_counter().await,
        }
    }
}

impl Suite {
    /// Run every spec in the built tree and return whether the suite passed
    ///
    /// # Panics
    ///
    /// Panics if the tree has not been built with [`Suite::build_tree`].
    pub async fn run(
        &mut self,
        description: &str,
        suite_path: &str,
        collaborators: Collaborators,
        config: SuiteConfig,
    ) -> bool {
        if self.phase() != Phase::BuildTree {
            panic!("Suite::run called before Suite::build_tree");
        }

        let specs = self.specs();
        self.shared.set_phase(Phase::Run);
        self.shared.set_writer(Arc::clone(&collaborators.writer));
        self.collaborators = collaborators;
        self.config = config;
        self.skip_all = false;
        self.deadline = self.config.timeout().map(|timeout| Instant::now() + timeout);

        info!(
            "Running suite '{}' ({} specs, process {}/{})",
            description,
            specs.len(),
            self.config.parallel_process,
            self.config.parallel_total
        );

        self.run_specs(description, suite_path, specs).await
    }

    async fn run_specs(&mut self, description: &str, suite_path: &str, specs: Vec<Spec>) -> bool {
        let specs_that_will_run = specs
            .iter()
            .filter(|spec| !spec.skip && !spec.is_pending())
            .count();

        self.report = Report {
            suite_path: suite_path.to_string(),
            suite_description: description.to_string(),
            suite_config: self.config.clone(),
            pre_run_stats: PreRunStats {
                total_specs: specs.len(),
                specs_that_will_run,
            },
            start_time: Some(Utc::now()),
            ..Default::default()
        };

        self.collaborators.reporter.suite_will_begin(&self.report);
        if let Some(client) = self.parallel_client() {
            if let Err(e) = client.post_suite_will_begin(&self.report).await {
                warn!("Failed to post suite start: {}", e);
            }
        }

        self.report.suite_succeeded = true;
        self.run_before_suite(specs_that_will_run).await;

        if self.report.suite_succeeded {
            self.run_groups(&specs).await;

            if self.config.fail_on_pending && specs.iter().any(|spec| spec.is_pending()) {
                self.report
                    .special_suite_failure_reasons
                    .push("Detected pending specs and --fail-on-pending is set".to_string());
                self.report.suite_succeeded = false;
            }
        }

        self.run_after_suite_cleanup(specs_that_will_run).await;

        let status = self.interrupt_status();
        if status.interrupted() {
            self.report
                .special_suite_failure_reasons
                .push(status.cause.to_string());
            self.report.suite_succeeded = false;
        }

        let end = Utc::now();
        self.report.end_time = Some(end);
        self.report.run_time = elapsed(self.report.start_time, end);
        if self.deadline.is_some_and(|deadline| Instant::now() > deadline) {
            self.report
                .special_suite_failure_reasons
                .push("Suite Timeout Elapsed".to_string());
            self.report.suite_succeeded = false;
        }

        if self.config.is_primary_process() {
            self.run_report_after_suite().await;
        }

        self.collaborators.reporter.suite_did_end(&self.report);
        if let Some(client) = self.parallel_client() {
            if let Err(e) = client.post_suite_did_end(&self.report).await {
                warn!("Failed to post suite end: {}", e);
            }
        }

        info!(
            "Suite '{}' finished: {} ({} specs reported in {:?})",
            description,
            if self.report.suite_succeeded { "passed" } else { "failed" },
            self.report.spec_reports.len(),
            self.report.run_time
        );
        self.report.suite_succeeded
    }

    async fn run_groups(&mut self, specs: &[Spec]) {
        let (mut groups, mut serial_groups) = order_specs(specs, &self.config);
        debug!(
            "Dispatching {} groups ({} serial)",
            groups.len(),
            serial_groups.len()
        );

        let mut source = if self.is_running_in_parallel() {
            self.client().map(IndexSource::Client)
        } else {
            Ok(IndexSource::Local(0))
        };

        loop {
            let next = match &mut source {
                Ok(source) => source.next().await,
                Err(e) => Err(e.clone()),
            };
            let idx = match next {
                Ok(idx) => idx,
                Err(e) => {
                    self.report
                        .special_suite_failure_reasons
                        .push(format!("Failed to iterate over specs:\n{e}"));
                    self.report.suite_succeeded = false;
                    break;
                }
            };

            if idx >= groups.len() {
                if self.config.is_primary_process() && !serial_groups.is_empty() {
                    groups = std::mem::take(&mut serial_groups);
                    source = Ok(IndexSource::Local(0));
                    if let Err(e) = self.block_until_nonprimary_procs_have_finished().await {
                        warn!("Failed waiting for other processes before serial specs: {}", e);
                    }
                    continue;
                }
                break;
            }

            let group: Vec<Spec> = groups[idx].iter().map(|&i| specs[i].clone()).collect();
            let runner = Arc::clone(&self.collaborators.group_runner);
            runner.run(self, group).await;
        }
    }

    pub(crate) async fn block_until_nonprimary_procs_have_finished(&self) -> Result<(), ParallelError> {
        self.client()?.block_until_nonprimary_procs_have_finished().await
    }

    fn begin_suite_node_report(&self, node: &Node, text: &str) {
        let report = SpecReport::for_node(
            node.node_type,
            node.code_location.clone(),
            text,
            self.config.parallel_process,
        );
        self.begin_spec_report(report);
        self.collaborators
            .reporter
            .will_run(&self.shared.recorded_spec_report());
    }

    async fn run_before_suite(&mut self, specs_that_will_run: usize) {
        let Some(node) = self.suite_nodes.first_with_type(|t| t.is_before_suite()) else {
            return;
        };
        if specs_that_will_run == 0 {
            return;
        }

        self.begin_suite_node_report(&node, "");
        self.run_suite_node(node).await;
        if self.current_state() == SpecState::Skipped {
            self.report
                .special_suite_failure_reasons
                .push("Suite skipped in BeforeSuite".to_string());
            self.skip_all = true;
        }
        self.process_current_spec_report().await;
    }

    async fn run_after_suite_cleanup(&mut self, specs_that_will_run: usize) {
        if let Some(node) = self.suite_nodes.first_with_type(|t| t.is_after_suite()) {
            if specs_that_will_run > 0 {
                self.begin_suite_node_report(&node, "");
                self.run_suite_node(node).await;
                self.process_current_spec_report().await;
            }
        }

        let mut cleanups = self.shared.cleanup_nodes_with_type(NodeType::CleanupAfterSuite);
        cleanups.reverse();
        for node in cleanups {
            self.begin_suite_node_report(&node, "");
            self.run_suite_node(node).await;
            self.process_current_spec_report().await;
        }
    }

    async fn run_report_after_suite(&mut self) {
        let nodes = self.suite_nodes.with_type(|t| t == NodeType::ReportAfterSuite);
        for node in nodes {
            self.begin_suite_node_report(&node, &node.text);
            let report = self.report.clone();
            self.run_report_after_suite_node(node, report).await;
            self.process_current_spec_report().await;
        }
    }
}
