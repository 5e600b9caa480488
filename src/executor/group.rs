//! Spec groups
//!
//! A group is the unit handed out by the run loop: a run of specs sharing an
//! ordered container, or a single spec. [`OrderedGroup`] runs the specs of a
//! group one after another, running `BeforeAll` and `AfterAll` nodes once for
//! the whole group.

use async_trait::async_trait;
use chrono::Utc;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;
use tracing::debug;

use super::progress::elapsed;
use crate::models::{
    AdditionalFailure, Failure, Node, NodeType, NodesExt, Spec, SpecReport, SpecState,
};
use crate::suite::Suite;

/// Runs one group of specs against the suite
#[async_trait]
pub trait GroupRunner: Send + Sync {
    async fn run(&self, suite: &mut Suite, specs: Vec<Spec>);
}

/// Default group runner
#[derive(Debug, Default, Clone, Copy)]
pub struct OrderedGroup;

#[async_trait]
impl GroupRunner for OrderedGroup {
    async fn run(&self, suite: &mut Suite, specs: Vec<Spec>) {
        GroupRun::new(specs).run(suite).await;
    }
}

fn is_run_once(node: &Node) -> bool {
    matches!(node.node_type, NodeType::BeforeAll | NodeType::AfterAll)
}

fn initial_report(spec: &Spec, process: usize) -> SpecReport {
    let leaf = spec.leaf();
    SpecReport {
        container_hierarchy_texts: spec.container_texts(),
        container_hierarchy_locations: spec
            .containers()
            .iter()
            .map(|n| n.code_location.clone())
            .collect(),
        leaf_node_type: leaf.map(|n| n.node_type),
        leaf_node_location: leaf.map(|n| n.code_location.clone()).unwrap_or_default(),
        leaf_node_text: leaf.map(|n| n.text.clone()).unwrap_or_default(),
        parallel_process: process,
        is_serial: spec.is_serial(),
        is_in_ordered_container: spec.is_in_ordered_container(),
        ..Default::default()
    }
}

struct GroupRun {
    specs: Vec<Spec>,
    succeeded: bool,
    /// Outcome of each `BeforeAll` that already ran, by node id
    run_once: HashMap<u64, SpecState>,
}

impl GroupRun {
    fn new(specs: Vec<Spec>) -> Self {
        Self {
            specs,
            succeeded: true,
            run_once: HashMap::new(),
        }
    }

    async fn run(mut self, suite: &mut Suite) {
        for idx in 0..self.specs.len() {
            let spec = self.specs[idx].clone();
            suite.begin_spec_report(initial_report(&spec, suite.config.parallel_process));

            let (state, failure) = self.evaluate_skip_status(suite, &spec).await;
            let start = Utc::now();
            suite.update_current_spec_report(|r| {
                r.state = state;
                r.failure = failure;
                r.start_time = Some(start);
            });
            suite
                .collaborators
                .reporter
                .will_run(&suite.current_spec_report());

            suite.report_each(&spec, NodeType::ReportBeforeEach).await;

            let state = suite.current_state();
            let skip = suite.config.dry_run
                || state.is_failure()
                || matches!(state, SpecState::Skipped | SpecState::Pending);
            if !skip {
                debug!("Running spec '{}'", spec.text());
                suite.update_current_spec_report(|r| r.num_attempts = 1);
                let writer = suite.collaborators.writer.clone();
                let interceptor = suite.collaborators.output_interceptor.clone();
                writer.truncate();
                interceptor.start_intercepting_output();

                self.attempt(suite, idx).await;

                let writer_output = String::from_utf8_lossy(&writer.bytes()).into_owned();
                let std_output = interceptor.stop_intercepting_and_return_output();
                suite.update_current_spec_report(|r| {
                    r.captured_writer_output.push_str(&writer_output);
                    r.captured_std_out_err.push_str(&std_output);
                });
            } else if suite.config.dry_run && state == SpecState::Invalid {
                suite.update_current_spec_report(|r| r.state = SpecState::Passed);
            }

            let end = Utc::now();
            suite.update_current_spec_report(|r| {
                r.end_time = Some(end);
                r.run_time = elapsed(r.start_time, end);
            });
            if suite.current_state().is_failure() {
                self.succeeded = false;
            }

            suite.report_each(&spec, NodeType::ReportAfterEach).await;
            suite.process_current_spec_report().await;
            suite.begin_spec_report(SpecReport::default());
        }
    }

    async fn evaluate_skip_status(&self, suite: &Suite, spec: &Spec) -> (SpecState, Failure) {
        if spec.is_pending() {
            return (SpecState::Pending, Failure::default());
        }
        if spec.skip {
            return (SpecState::Skipped, Failure::default());
        }
        if suite.interrupt_status().interrupted() || suite.skip_all {
            return (SpecState::Skipped, Failure::default());
        }
        if suite.deadline.is_some_and(|deadline| Instant::now() > deadline) {
            return (SpecState::Skipped, Failure::default());
        }
        if let Some(client) = suite.parallel_client() {
            if client.should_abort().await {
                return (SpecState::Skipped, Failure::default());
            }
        }
        if !self.succeeded {
            let failure = spec
                .leaf()
                .map(|leaf| {
                    Suite::failure_for_leaf_node_with_message(
                        leaf,
                        "Spec skipped because an earlier spec in an ordered container failed",
                    )
                })
                .unwrap_or_default();
            return (SpecState::Skipped, failure);
        }
        (SpecState::Invalid, Failure::default())
    }

    /// Whether no later spec in the group that will run contains `node_id`
    fn is_last_spec_with(&self, idx: usize, node_id: u64) -> bool {
        !self.specs[idx + 1..]
            .iter()
            .filter(|spec| !spec.skip && !spec.is_pending())
            .any(|spec| spec.nodes.iter().any(|n| n.id == node_id))
    }

    async fn attempt(&mut self, suite: &mut Suite, idx: usize) {
        let spec = self.specs[idx].clone();
        let spec_deadline = spec
            .leaf()
            .and_then(|leaf| leaf.spec_timeout)
            .filter(|timeout| !timeout.is_zero())
            .map(|timeout| Instant::now() + timeout);

        let mut setup = spec.nodes.with_type(|t| t == NodeType::BeforeAll);
        setup.extend(spec.nodes.with_type(|t| t == NodeType::BeforeEach));
        setup.sort_by_key(|n| n.nesting_level);
        let mut just_before = spec.nodes.with_type(|t| t == NodeType::JustBeforeEach);
        just_before.sort_by_key(|n| n.nesting_level);
        setup.extend(just_before);
        setup.extend(spec.leaf().cloned());

        let mut terminating: Option<Node> = None;
        for node in setup {
            if node.node_type == NodeType::BeforeAll
                && self.run_once.get(&node.id) == Some(&SpecState::Passed)
            {
                continue;
            }
            let text = spec.best_text_for(&node);
            let outcome = suite.run_node(&node, spec_deadline, &text).await;
            let state = outcome.0;
            suite.record_outcome(outcome);
            if node.node_type == NodeType::BeforeAll {
                self.run_once.insert(node.id, state);
            }
            if state != SpecState::Passed {
                terminating = Some(node);
                break;
            }
        }

        let mut ran: HashSet<u64> = HashSet::new();
        let mut include_cleanup = false;
        loop {
            let mut after = spec.nodes.with_type(|t| t == NodeType::JustAfterEach);
            after.sort_by_key(|n| Reverse(n.nesting_level));
            let mut teardown = spec
                .nodes
                .with_type(|t| matches!(t, NodeType::AfterEach | NodeType::AfterAll));
            teardown.sort_by_key(|n| Reverse(n.nesting_level));
            after.extend(teardown);
            if let Some(terminating) = &terminating {
                after.retain(|n| n.nesting_level <= terminating.nesting_level);
            }
            if include_cleanup {
                let mut each = suite.cleanup_nodes_with_type(NodeType::CleanupAfterEach);
                each.reverse();
                after.extend(each);
                let mut all = suite.cleanup_nodes_with_type(NodeType::CleanupAfterAll);
                all.reverse();
                after.extend(all);
            }

            let state = suite.current_state();
            after.retain(|n| self.should_run_after_node(n, idx, &spec, state, &ran, terminating.as_ref()));
            if after.is_empty() && include_cleanup {
                break;
            }

            for node in after {
                ran.insert(node.id);
                let text = spec.best_text_for(&node);
                let (state, failure) = suite.run_node(&node, spec_deadline, &text).await;
                let current = suite.current_state();
                if current == SpecState::Passed || state == SpecState::Aborted {
                    suite.record_outcome((state, failure));
                } else if state.is_failure() {
                    suite.update_current_spec_report(|r| {
                        r.additional_failures.push(AdditionalFailure { state, failure })
                    });
                }
            }
            include_cleanup = true;
        }
    }

    /// Teardown filter: run-once nodes and their cleanups only run when
    /// the group is done with them
    fn should_run_after_node(
        &self,
        node: &Node,
        idx: usize,
        spec: &Spec,
        state: SpecState,
        ran: &HashSet<u64>,
        terminating: Option<&Node>,
    ) -> bool {
        if ran.contains(&node.id) {
            return false;
        }

        let governing = if node.node_type.is_cleanup() {
            let Some(generator) = node.node_id_where_cleanup_was_generated else {
                return true;
            };
            if ran.contains(&generator) {
                return true;
            }
            match spec.nodes.iter().find(|n| n.id == generator) {
                Some(generator) if is_run_once(generator) => generator,
                _ => return true,
            }
        } else if is_run_once(node) {
            node
        } else {
            return true;
        };

        let is_last = self.is_last_spec_with(idx, governing.id);
        match state {
            SpecState::Passed => is_last,
            SpecState::Skipped | SpecState::Pending => {
                is_last
                    || terminating.is_some_and(|t| {
                        t.node_type == NodeType::BeforeAll && governing.nesting_level == t.nesting_level
                    })
            }
            SpecState::Failed
            | SpecState::Panicked
            | SpecState::Timedout
            | SpecState::Interrupted
            | SpecState::Aborted => true,
            SpecState::Invalid => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SuiteConfig;
    use crate::models::{BodyError, NodeBody};
    use crate::test_support::{run_suite, RecordingReporter};
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<String>>>;

    fn logging(log: &Log, name: &str) -> NodeBody {
        let log = log.clone();
        let name = name.to_string();
        NodeBody::blocking(move || {
            log.lock().push(name.clone());
            Ok(())
        })
    }

    fn failing(log: &Log, name: &str) -> NodeBody {
        let log = log.clone();
        let name = name.to_string();
        NodeBody::blocking(move || {
            log.lock().push(name.clone());
            Err(BodyError::fail(format!("{name} failed")))
        })
    }

    async fn run(suite: &mut Suite) -> bool {
        suite.build_tree().unwrap();
        run_suite(suite, Arc::new(RecordingReporter::default()), SuiteConfig::default()).await
    }

    #[tokio::test]
    async fn test_node_order_within_a_spec() {
        let log: Log = Arc::default();
        let l = log.clone();
        let mut suite = Suite::new();
        suite
            .push_node(Node::container("outer", move |s| {
                s.push_node(Node::before_each(logging(&l, "outer before")))?;
                s.push_node(Node::after_each(logging(&l, "outer after")))?;
                let l2 = l.clone();
                s.push_node(Node::container("inner", move |s| {
                    s.push_node(Node::just_after_each(logging(&l2, "just after")))?;
                    s.push_node(Node::after_each(logging(&l2, "inner after")))?;
                    s.push_node(Node::just_before_each(logging(&l2, "just before")))?;
                    s.push_node(Node::before_each(logging(&l2, "inner before")))?;
                    s.push_node(Node::it("leaf", logging(&l2, "leaf")))?;
                    let l3 = l2.clone();
                    s.push_node(Node::report_before_each(move |_| {
                        l3.lock().push("report before".into());
                        Ok(())
                    }))?;
                    let l4 = l2.clone();
                    s.push_node(Node::report_after_each(move |_| {
                        l4.lock().push("report after".into());
                        Ok(())
                    }))
                }))
            }))
            .unwrap();

        assert!(run(&mut suite).await);
        assert_eq!(
            *log.lock(),
            vec![
                "report before",
                "outer before",
                "inner before",
                "just before",
                "leaf",
                "just after",
                "inner after",
                "outer after",
                "report after"
            ]
        );
    }

    #[tokio::test]
    async fn test_before_all_and_after_all_run_once_per_group() {
        let log: Log = Arc::default();
        let l = log.clone();
        let mut suite = Suite::new();
        suite
            .push_node(
                Node::container("ordered", move |s| {
                    s.push_node(Node::before_all(logging(&l, "before all")))?;
                    s.push_node(Node::after_all(logging(&l, "after all")))?;
                    s.push_node(Node::it("first", logging(&l, "first")))?;
                    s.push_node(Node::it("second", logging(&l, "second")))
                })
                .ordered(),
            )
            .unwrap();

        assert!(run(&mut suite).await);
        assert_eq!(
            *log.lock(),
            vec!["before all", "first", "second", "after all"]
        );
    }

    #[tokio::test]
    async fn test_failure_in_ordered_container_skips_rest_and_runs_after_all() {
        let log: Log = Arc::default();
        let l = log.clone();
        let mut suite = Suite::new();
        suite
            .push_node(
                Node::container("ordered", move |s| {
                    s.push_node(Node::after_all(logging(&l, "after all")))?;
                    s.push_node(Node::it("first", failing(&l, "first")))?;
                    s.push_node(Node::it("second", logging(&l, "second")))
                })
                .ordered(),
            )
            .unwrap();

        assert!(!run(&mut suite).await);
        assert_eq!(*log.lock(), vec!["first", "after all"]);
        let reports = &suite.report().spec_reports;
        assert_eq!(reports[0].state, SpecState::Failed);
        assert_eq!(reports[1].state, SpecState::Skipped);
        assert_eq!(
            reports[1].failure.message,
            "Spec skipped because an earlier spec in an ordered container failed"
        );
    }

    #[tokio::test]
    async fn test_failing_before_each_skips_leaf_but_runs_after_each() {
        let log: Log = Arc::default();
        let l = log.clone();
        let mut suite = Suite::new();
        suite
            .push_node(Node::container("outer", move |s| {
                s.push_node(Node::before_each(failing(&l, "outer before")))?;
                s.push_node(Node::after_each(logging(&l, "outer after")))?;
                let l2 = l.clone();
                s.push_node(Node::container("inner", move |s| {
                    s.push_node(Node::after_each(logging(&l2, "inner after")))?;
                    s.push_node(Node::it("leaf", logging(&l2, "leaf")))
                }))
            }))
            .unwrap();

        assert!(!run(&mut suite).await);
        assert_eq!(*log.lock(), vec!["outer before", "outer after"]);
        assert_eq!(suite.report().spec_reports[0].failure.message, "outer before failed");
    }

    #[tokio::test]
    async fn test_teardown_failure_after_spec_failure_is_additional() {
        let log: Log = Arc::default();
        let l = log.clone();
        let mut suite = Suite::new();
        suite
            .push_node(Node::container("c", move |s| {
                s.push_node(Node::after_each(failing(&l, "after")))?;
                s.push_node(Node::it("leaf", failing(&l, "leaf")))
            }))
            .unwrap();

        assert!(!run(&mut suite).await);
        let report = &suite.report().spec_reports[0];
        assert_eq!(report.failure.message, "leaf failed");
        assert_eq!(report.additional_failures.len(), 1);
        assert_eq!(report.additional_failures[0].failure.message, "after failed");
    }

    #[tokio::test]
    async fn test_deferred_cleanup_runs_after_after_each_in_reverse() {
        let log: Log = Arc::default();
        let mut suite = Suite::new();
        let handle = suite.handle();
        let l = log.clone();
        suite
            .push_node(Node::container("c", move |s| {
                s.push_node(Node::after_each(logging(&l, "after each")))?;
                let l2 = l.clone();
                let handle = handle.clone();
                s.push_node(Node::it(
                    "leaf",
                    NodeBody::blocking(move || {
                        for name in ["cleanup 1", "cleanup 2"] {
                            handle
                                .defer_cleanup(logging(&l2, name))
                                .map_err(|e| BodyError::fail(e.to_string()))?;
                        }
                        Ok(())
                    }),
                ))
            }))
            .unwrap();

        assert!(run(&mut suite).await);
        assert_eq!(*log.lock(), vec!["after each", "cleanup 2", "cleanup 1"]);
    }

    #[tokio::test]
    async fn test_before_all_cleanup_waits_for_last_spec() {
        let log: Log = Arc::default();
        let mut suite = Suite::new();
        let handle = suite.handle();
        let l = log.clone();
        suite
            .push_node(
                Node::container("ordered", move |s| {
                    let l2 = l.clone();
                    let handle = handle.clone();
                    s.push_node(Node::before_all(NodeBody::blocking(move || {
                        l2.lock().push("before all".into());
                        handle
                            .defer_cleanup(logging(&l2, "cleanup all"))
                            .map_err(|e| BodyError::fail(e.to_string()))
                    })))?;
                    s.push_node(Node::it("first", logging(&l, "first")))?;
                    s.push_node(Node::it("second", logging(&l, "second")))
                })
                .ordered(),
            )
            .unwrap();

        assert!(run(&mut suite).await);
        assert_eq!(
            *log.lock(),
            vec!["before all", "first", "second", "cleanup all"]
        );
    }

    #[tokio::test]
    async fn test_spec_timeout_on_leaf() {
        let mut suite = Suite::new();
        suite
            .push_node(
                Node::it(
                    "slow",
                    NodeBody::from_async(|ctx| async move {
                        ctx.cancelled().await;
                        Ok(())
                    }),
                )
                .with_spec_timeout(std::time::Duration::from_millis(20)),
            )
            .unwrap();

        assert!(!run(&mut suite).await);
        assert_eq!(suite.report().spec_reports[0].state, SpecState::Timedout);
    }

    #[tokio::test]
    async fn test_dry_run_passes_without_running_bodies() {
        let log: Log = Arc::default();
        let mut suite = Suite::new();
        suite.push_node(Node::it("a", logging(&log, "a"))).unwrap();
        suite.build_tree().unwrap();

        let passed = run_suite(
            &mut suite,
            Arc::new(RecordingReporter::default()),
            SuiteConfig::default().dry_run(true),
        )
        .await;
        assert!(passed);
        assert!(log.lock().is_empty());
        assert_eq!(suite.report().spec_reports[0].state, SpecState::Passed);
    }
}
