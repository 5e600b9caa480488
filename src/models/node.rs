//! Node models
//!
//! Defines node types, code locations and the node record itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::body::{
    ContainerBody, DataBody, NodeBody, PayloadBody, ReportAfterSuiteBody, ReportEachBody,
};
use super::report::{Report, SpecReport};
use crate::suite::{Suite, SuiteError};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Kind of a declared node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Container,
    It,

    BeforeEach,
    JustBeforeEach,
    AfterEach,
    JustAfterEach,
    BeforeAll,
    AfterAll,

    ReportBeforeEach,
    ReportAfterEach,

    BeforeSuite,
    SynchronizedBeforeSuite,
    AfterSuite,
    SynchronizedAfterSuite,
    ReportAfterSuite,

    CleanupInvalid,
    CleanupAfterEach,
    CleanupAfterAll,
    CleanupAfterSuite,
}

impl NodeType {
    /// Get node type display name
    pub fn name(&self) -> &'static str {
        match self {
            NodeType::Container => "Container",
            NodeType::It => "It",
            NodeType::BeforeEach => "BeforeEach",
            NodeType::JustBeforeEach => "JustBeforeEach",
            NodeType::AfterEach => "AfterEach",
            NodeType::JustAfterEach => "JustAfterEach",
            NodeType::BeforeAll => "BeforeAll",
            NodeType::AfterAll => "AfterAll",
            NodeType::ReportBeforeEach => "ReportBeforeEach",
            NodeType::ReportAfterEach => "ReportAfterEach",
            NodeType::BeforeSuite => "BeforeSuite",
            NodeType::SynchronizedBeforeSuite => "SynchronizedBeforeSuite",
            NodeType::AfterSuite => "AfterSuite",
            NodeType::SynchronizedAfterSuite => "SynchronizedAfterSuite",
            NodeType::ReportAfterSuite => "ReportAfterSuite",
            NodeType::CleanupInvalid => "DeferCleanup",
            NodeType::CleanupAfterEach => "DeferCleanup (Each)",
            NodeType::CleanupAfterAll => "DeferCleanup (All)",
            NodeType::CleanupAfterSuite => "DeferCleanup (Suite)",
        }
    }

    pub fn is_cleanup(&self) -> bool {
        matches!(
            self,
            NodeType::CleanupInvalid
                | NodeType::CleanupAfterEach
                | NodeType::CleanupAfterAll
                | NodeType::CleanupAfterSuite
        )
    }

    /// Nodes that are registered once for the whole suite
    pub fn is_suite_level(&self) -> bool {
        matches!(
            self,
            NodeType::BeforeSuite
                | NodeType::SynchronizedBeforeSuite
                | NodeType::AfterSuite
                | NodeType::SynchronizedAfterSuite
                | NodeType::ReportAfterSuite
                | NodeType::CleanupAfterSuite
        )
    }

    pub fn is_before_suite(&self) -> bool {
        matches!(self, NodeType::BeforeSuite | NodeType::SynchronizedBeforeSuite)
    }

    pub fn is_after_suite(&self) -> bool {
        matches!(self, NodeType::AfterSuite | NodeType::SynchronizedAfterSuite)
    }

    pub fn is_reporting(&self) -> bool {
        matches!(
            self,
            NodeType::ReportBeforeEach | NodeType::ReportAfterEach | NodeType::ReportAfterSuite
        )
    }

    /// Node types that still run once a report-only interrupt was received
    pub fn allowed_during_report_interrupt(&self) -> bool {
        self.is_reporting()
    }

    /// Node types that still run once a cleanup-and-report interrupt was received
    pub fn allowed_during_cleanup_interrupt(&self) -> bool {
        matches!(
            self,
            NodeType::AfterEach
                | NodeType::JustAfterEach
                | NodeType::AfterAll
                | NodeType::AfterSuite
                | NodeType::SynchronizedAfterSuite
                | NodeType::CleanupAfterEach
                | NodeType::CleanupAfterAll
                | NodeType::CleanupAfterSuite
        )
    }

    /// Setup and teardown nodes that belong to a spec chain
    pub fn is_spec_setup_or_teardown(&self) -> bool {
        matches!(
            self,
            NodeType::BeforeEach
                | NodeType::JustBeforeEach
                | NodeType::AfterEach
                | NodeType::JustAfterEach
                | NodeType::BeforeAll
                | NodeType::AfterAll
                | NodeType::ReportBeforeEach
                | NodeType::ReportAfterEach
        )
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Source location of a node, failure or report entry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeLocation {
    pub file_name: String,
    pub line_number: u32,
    pub full_stack_trace: Option<String>,
}

impl CodeLocation {
    pub fn new(file_name: impl Into<String>, line_number: u32) -> Self {
        Self {
            file_name: file_name.into(),
            line_number,
            full_stack_trace: None,
        }
    }

    /// Location of the caller of the function annotated with `#[track_caller]`
    #[track_caller]
    pub fn caller() -> Self {
        let location = std::panic::Location::caller();
        Self::new(location.file(), location.line())
    }

    /// Attach the current stack trace
    pub fn with_stack_trace(mut self) -> Self {
        self.full_stack_trace = Some(std::backtrace::Backtrace::force_capture().to_string());
        self
    }

    pub fn is_zero(&self) -> bool {
        self.file_name.is_empty() && self.line_number == 0
    }
}

impl fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            write!(f, "<unknown>")
        } else {
            write!(f, "{}:{}", self.file_name, self.line_number)
        }
    }
}

/// Bodies used by synchronized before-suite nodes
#[derive(Clone)]
pub struct SynchronizedBeforeSuiteBodies {
    pub proc1: DataBody,
    pub all_procs: PayloadBody,
}

/// Bodies used by synchronized after-suite nodes
#[derive(Clone)]
pub struct SynchronizedAfterSuiteBodies {
    pub all_procs: NodeBody,
    pub proc1: NodeBody,
}

/// A single declared unit of behavior
#[derive(Clone)]
pub struct Node {
    pub id: u64,
    pub node_type: NodeType,
    pub text: String,
    pub code_location: CodeLocation,
    pub nesting_level: i32,

    pub body: Option<NodeBody>,
    pub container_body: Option<ContainerBody>,
    pub synchronized_before_suite: Option<SynchronizedBeforeSuiteBodies>,
    pub synchronized_after_suite: Option<SynchronizedAfterSuiteBodies>,
    pub report_each_body: Option<ReportEachBody>,
    pub report_after_suite_body: Option<ReportAfterSuiteBody>,

    /// Per-node timeout; `None` means no node-level timeout
    pub node_timeout: Option<Duration>,
    /// Spec-level timeout, only meaningful on leaf nodes
    pub spec_timeout: Option<Duration>,
    /// `None` inherits the suite grace period
    pub grace_period: Option<Duration>,
    pub poll_progress_after: Option<Duration>,
    pub poll_progress_interval: Option<Duration>,

    pub marked_serial: bool,
    pub marked_ordered: bool,
    pub marked_pending: bool,
    pub marked_suppress_progress_reporting: bool,

    pub node_id_where_cleanup_was_generated: Option<u64>,
}

impl Node {
    #[track_caller]
    fn base(node_type: NodeType, text: impl Into<String>) -> Self {
        Self {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            node_type,
            text: text.into(),
            code_location: CodeLocation::caller(),
            nesting_level: 0,
            body: None,
            container_body: None,
            synchronized_before_suite: None,
            synchronized_after_suite: None,
            report_each_body: None,
            report_after_suite_body: None,
            node_timeout: None,
            spec_timeout: None,
            grace_period: None,
            poll_progress_after: None,
            poll_progress_interval: None,
            marked_serial: false,
            marked_ordered: false,
            marked_pending: false,
            marked_suppress_progress_reporting: false,
            node_id_where_cleanup_was_generated: None,
        }
    }

    /// Create a node with a plain body
    #[track_caller]
    pub fn new(node_type: NodeType, text: impl Into<String>, body: NodeBody) -> Self {
        let mut node = Self::base(node_type, text);
        node.body = Some(body);
        node
    }

    /// Create a container whose children are registered by `build`
    #[track_caller]
    pub fn container<F>(text: impl Into<String>, build: F) -> Self
    where
        F: Fn(&mut Suite) -> Result<(), SuiteError> + Send + Sync + 'static,
    {
        let mut node = Self::base(NodeType::Container, text);
        node.container_body = Some(Arc::new(build));
        node
    }

    #[track_caller]
    pub fn it(text: impl Into<String>, body: NodeBody) -> Self {
        Self::new(NodeType::It, text, body)
    }

    #[track_caller]
    pub fn before_each(body: NodeBody) -> Self {
        Self::new(NodeType::BeforeEach, "", body)
    }

    #[track_caller]
    pub fn just_before_each(body: NodeBody) -> Self {
        Self::new(NodeType::JustBeforeEach, "", body)
    }

    #[track_caller]
    pub fn after_each(body: NodeBody) -> Self {
        Self::new(NodeType::AfterEach, "", body)
    }

    #[track_caller]
    pub fn just_after_each(body: NodeBody) -> Self {
        Self::new(NodeType::JustAfterEach, "", body)
    }

    #[track_caller]
    pub fn before_all(body: NodeBody) -> Self {
        Self::new(NodeType::BeforeAll, "", body)
    }

    #[track_caller]
    pub fn after_all(body: NodeBody) -> Self {
        Self::new(NodeType::AfterAll, "", body)
    }

    #[track_caller]
    pub fn before_suite(body: NodeBody) -> Self {
        Self::new(NodeType::BeforeSuite, "", body)
    }

    #[track_caller]
    pub fn after_suite(body: NodeBody) -> Self {
        Self::new(NodeType::AfterSuite, "", body)
    }

    /// Before-suite split into a proc-1-only segment and an all-processes segment
    #[track_caller]
    pub fn synchronized_before_suite(proc1: DataBody, all_procs: PayloadBody) -> Self {
        let mut node = Self::base(NodeType::SynchronizedBeforeSuite, "");
        node.synchronized_before_suite = Some(SynchronizedBeforeSuiteBodies { proc1, all_procs });
        node
    }

    /// After-suite split into an all-processes segment and a proc-1-only segment
    #[track_caller]
    pub fn synchronized_after_suite(all_procs: NodeBody, proc1: NodeBody) -> Self {
        let mut node = Self::base(NodeType::SynchronizedAfterSuite, "");
        node.synchronized_after_suite = Some(SynchronizedAfterSuiteBodies { all_procs, proc1 });
        node
    }

    #[track_caller]
    pub fn report_before_each<F>(body: F) -> Self
    where
        F: Fn(SpecReport) -> super::BodyResult + Send + Sync + 'static,
    {
        let mut node = Self::base(NodeType::ReportBeforeEach, "");
        node.report_each_body = Some(Arc::new(body));
        node
    }

    #[track_caller]
    pub fn report_after_each<F>(body: F) -> Self
    where
        F: Fn(SpecReport) -> super::BodyResult + Send + Sync + 'static,
    {
        let mut node = Self::base(NodeType::ReportAfterEach, "");
        node.report_each_body = Some(Arc::new(body));
        node
    }

    #[track_caller]
    pub fn report_after_suite<F>(text: impl Into<String>, body: F) -> Self
    where
        F: Fn(Report) -> super::BodyResult + Send + Sync + 'static,
    {
        let mut node = Self::base(NodeType::ReportAfterSuite, text);
        node.report_after_suite_body = Some(Arc::new(body));
        node
    }

    /// Cleanup node; its final type is decided when it is registered
    #[track_caller]
    pub fn cleanup(body: NodeBody) -> Self {
        Self::new(NodeType::CleanupInvalid, "", body)
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = Some(timeout);
        self
    }

    pub fn with_spec_timeout(mut self, timeout: Duration) -> Self {
        self.spec_timeout = Some(timeout);
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = Some(grace_period);
        self
    }

    pub fn with_poll_progress_after(mut self, after: Duration) -> Self {
        self.poll_progress_after = Some(after);
        self
    }

    pub fn with_poll_progress_interval(mut self, interval: Duration) -> Self {
        self.poll_progress_interval = Some(interval);
        self
    }

    pub fn serial(mut self) -> Self {
        self.marked_serial = true;
        self
    }

    pub fn ordered(mut self) -> Self {
        self.marked_ordered = true;
        self
    }

    pub fn pending(mut self) -> Self {
        self.marked_pending = true;
        self
    }

    pub fn suppress_progress_reporting(mut self) -> Self {
        self.marked_suppress_progress_reporting = true;
        self
    }

    /// Whether the current body observes cancellation
    pub fn has_context(&self) -> bool {
        self.body.as_ref().map(|b| b.has_context()).unwrap_or(false)
    }

    pub fn is_zero(&self) -> bool {
        self.id == 0
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("node_type", &self.node_type)
            .field("text", &self.text)
            .field("code_location", &self.code_location)
            .field("nesting_level", &self.nesting_level)
            .field("has_context", &self.has_context())
            .finish_non_exhaustive()
    }
}

/// Helpers over ordered node lists
pub trait NodesExt {
    fn with_type(&self, predicate: impl Fn(NodeType) -> bool) -> Vec<Node>;
    fn first_with_type(&self, predicate: impl Fn(NodeType) -> bool) -> Option<Node>;
    fn without_node(&self, node: &Node) -> Vec<Node>;
}

impl NodesExt for [Node] {
    fn with_type(&self, predicate: impl Fn(NodeType) -> bool) -> Vec<Node> {
        self.iter()
            .filter(|n| predicate(n.node_type))
            .cloned()
            .collect()
    }

    fn first_with_type(&self, predicate: impl Fn(NodeType) -> bool) -> Option<Node> {
        self.iter().find(|n| predicate(n.node_type)).cloned()
    }

    fn without_node(&self, node: &Node) -> Vec<Node> {
        self.iter().filter(|n| n.id != node.id).cloned().collect()
    }
}
