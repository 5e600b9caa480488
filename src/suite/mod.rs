//! Suite lifecycle
//!
//! A [`Suite`] moves through three phases, strictly forward:
//!
//! 1. `BuildTopLevel`: nodes are pushed at the top level. Containers are
//!    recorded but not entered.
//! 2. `BuildTree`: [`Suite::build_tree`] enters each top-level container,
//!    invoking its build closure with the suite so nested nodes can be pushed.
//! 3. `Run`: [`Suite::run`] generates specs from the tree and drives them.
//!    No further nodes may be registered except cleanup nodes, which are
//!    pushed by running code through [`SuiteHandle::defer_cleanup`].

mod error;
mod run;
mod shared;
mod tree;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::time::Instant;

use crate::config::SuiteConfig;
use crate::executor::{GroupRunner, OrderedGroup};
use crate::interrupt::{InterruptHandler, InterruptSource, InterruptStatus, ProgressSignal};
use crate::models::{Node, NodeType, NodesExt, Report, Spec};
use crate::output::{BufferedWriter, NoopOutputInterceptor, OutputInterceptor, Writer};
use crate::parallel::{ParallelClient, ParallelError};
use crate::reporter::{NoopReporter, Reporter};

pub use error::SuiteError;
pub(crate) use shared::SharedState;
pub use shared::SuiteHandle;
pub use tree::GroupedSpecIndices;

use tree::TreeNode;

/// Lifecycle phase
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    BuildTopLevel,
    BuildTree,
    Run,
}

/// External collaborators a suite run reports to and reads from
pub struct Collaborators {
    pub reporter: Arc<dyn Reporter>,
    pub writer: Arc<dyn Writer>,
    pub output_interceptor: Arc<dyn OutputInterceptor>,
    pub interrupt_handler: Arc<dyn InterruptSource>,
    /// On-demand progress report requests
    pub progress_signal: Arc<ProgressSignal>,
    /// Required when running with more than one process
    pub client: Option<Arc<dyn ParallelClient>>,
    pub group_runner: Arc<dyn GroupRunner>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_writer(mut self, writer: Arc<dyn Writer>) -> Self {
        self.writer = writer;
        self
    }

    pub fn with_output_interceptor(mut self, interceptor: Arc<dyn OutputInterceptor>) -> Self {
        self.output_interceptor = interceptor;
        self
    }

    pub fn with_interrupt_source(mut self, source: Arc<dyn InterruptSource>) -> Self {
        self.interrupt_handler = source;
        self
    }

    pub fn with_progress_signal(mut self, signal: Arc<ProgressSignal>) -> Self {
        self.progress_signal = signal;
        self
    }

    pub fn with_client(mut self, client: Arc<dyn ParallelClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_group_runner(mut self, runner: Arc<dyn GroupRunner>) -> Self {
        self.group_runner = runner;
        self
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            reporter: Arc::new(NoopReporter),
            writer: Arc::new(BufferedWriter::new()),
            output_interceptor: Arc::new(NoopOutputInterceptor),
            interrupt_handler: Arc::new(InterruptHandler::new()),
            progress_signal: Arc::new(ProgressSignal::new()),
            client: None,
            group_runner: Arc::new(OrderedGroup),
        }
    }
}

/// A test suite: its node tree, suite-level nodes and run state
pub struct Suite {
    tree: TreeNode,
    top_level_containers: Vec<Node>,
    ancestors: Vec<Node>,
    suite_nodes: Vec<Node>,

    pub(crate) shared: Arc<SharedState>,
    pub(crate) collaborators: Collaborators,
    pub(crate) config: SuiteConfig,
    pub(crate) deadline: Option<Instant>,
    pub(crate) skip_all: bool,
    pub(crate) report: Report,
}

impl Suite {
    pub fn new() -> Self {
        Self {
            tree: TreeNode::default(),
            top_level_containers: Vec::new(),
            ancestors: Vec::new(),
            suite_nodes: Vec::new(),
            shared: Arc::new(SharedState::new()),
            collaborators: Collaborators::default(),
            config: SuiteConfig::default(),
            deadline: None,
            skip_all: false,
            report: Report::default(),
        }
    }

    /// Handle for code that runs inside nodes
    pub fn handle(&self) -> SuiteHandle {
        SuiteHandle::new(Arc::clone(&self.shared))
    }

    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    pub fn in_run_phase(&self) -> bool {
        self.phase() == Phase::Run
    }

    /// Register a node in the current context
    pub fn push_node(&mut self, mut node: Node) -> Result<(), SuiteError> {
        if node.node_type.is_cleanup() {
            return self.shared.push_cleanup(node);
        }
        if node.node_type.is_suite_level() {
            return self.push_suite_node(node);
        }

        let phase = self.phase();
        if phase == Phase::Run {
            return Err(SuiteError::PushingNodeInRunPhase {
                node_type: node.node_type,
                location: node.code_location,
            });
        }

        let first_ordered = self.ancestors.iter().find(|n| n.marked_ordered);
        if node.marked_serial {
            if let Some(ordered) = first_ordered {
                if !ordered.marked_serial {
                    return Err(SuiteError::InvalidSerialNodeInNonSerialOrderedContainer {
                        location: node.code_location,
                    });
                }
            }
        }
        if matches!(node.node_type, NodeType::BeforeAll | NodeType::AfterAll)
            && first_ordered.is_none()
        {
            return Err(SuiteError::SetupNodeNotInOrderedContainer {
                node_type: node.node_type,
                location: node.code_location,
            });
        }

        node.nesting_level = self.ancestors.len() as i32;

        if node.node_type != NodeType::Container {
            self.tree.children.push(TreeNode::new(node));
            return Ok(());
        }
        if phase == Phase::BuildTopLevel {
            self.top_level_containers.push(node);
            return Ok(());
        }
        self.enter_container(node)
    }

    fn enter_container(&mut self, node: Node) -> Result<(), SuiteError> {
        let build = node.container_body.clone();
        let location = node.code_location.clone();

        let parent = std::mem::replace(&mut self.tree, TreeNode::new(node.clone()));
        self.ancestors.push(node);

        let result = match build {
            Some(build) => catch_unwind(AssertUnwindSafe(|| build(self))).unwrap_or_else(|payload| {
                Err(SuiteError::CaughtPanicDuringABuildPhase {
                    message: panic_message(payload.as_ref()),
                    location,
                })
            }),
            None => Ok(()),
        };

        self.ancestors.pop();
        let container = std::mem::replace(&mut self.tree, parent);
        self.tree.children.push(container);
        result
    }

    fn push_suite_node(&mut self, node: Node) -> Result<(), SuiteError> {
        match self.phase() {
            Phase::BuildTree => {
                return Err(SuiteError::SuiteNodeInNestedContext {
                    node_type: node.node_type,
                    location: node.code_location,
                })
            }
            Phase::Run => {
                return Err(SuiteError::SuiteNodeDuringRunPhase {
                    node_type: node.node_type,
                    location: node.code_location,
                })
            }
            Phase::BuildTopLevel => {}
        }

        if node.node_type.is_before_suite() {
            if let Some(existing) = self.suite_nodes.first_with_type(|t| t.is_before_suite()) {
                return Err(SuiteError::MultipleBeforeSuiteNodes {
                    location: node.code_location,
                    existing: existing.code_location,
                });
            }
        }
        if node.node_type.is_after_suite() {
            if let Some(existing) = self.suite_nodes.first_with_type(|t| t.is_after_suite()) {
                return Err(SuiteError::MultipleAfterSuiteNodes {
                    location: node.code_location,
                    existing: existing.code_location,
                });
            }
        }

        self.suite_nodes.push(node);
        Ok(())
    }

    /// Enter every top-level container and build the full tree
    pub fn build_tree(&mut self) -> Result<(), SuiteError> {
        self.shared.set_phase(Phase::BuildTree);
        let containers = std::mem::take(&mut self.top_level_containers);
        for container in containers {
            self.push_node(container)?;
        }
        Ok(())
    }

    pub fn suite_nodes(&self) -> &[Node] {
        &self.suite_nodes
    }

    /// Every node registered in the tree so far, depth first
    pub fn tree_nodes(&self) -> Vec<Node> {
        self.tree.flatten()
    }

    pub fn specs(&self) -> Vec<Spec> {
        tree::generate_specs(&self.tree)
    }

    /// Aggregate report of the last run
    pub fn report(&self) -> &Report {
        &self.report
    }

    pub fn config(&self) -> &SuiteConfig {
        &self.config
    }

    pub fn skip_all(&self) -> bool {
        self.skip_all
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn is_running_in_parallel(&self) -> bool {
        self.config.is_running_in_parallel()
    }

    pub(crate) fn client(&self) -> Result<Arc<dyn ParallelClient>, ParallelError> {
        self.collaborators
            .client
            .clone()
            .ok_or(ParallelError::NotConnected)
    }

    /// The parallel client, only when running with more than one process
    pub(crate) fn parallel_client(&self) -> Option<Arc<dyn ParallelClient>> {
        if self.is_running_in_parallel() {
            self.collaborators.client.clone()
        } else {
            None
        }
    }

    pub fn interrupt_status(&self) -> InterruptStatus {
        self.collaborators.interrupt_handler.status()
    }
}

impl Default for Suite {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("non-string panic payload")
    }
}
