//! State shared between the controlling flow and running node bodies
//!
//! Only the fields a live body can observe sit behind the selective lock.
//! Every accessor holds a lock for a single read or write and never across
//! a call into user code or a collaborator.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use super::{Phase, SuiteError};
use crate::context::SpecContext;
use crate::models::{
    CodeLocation, Node, NodeBody, NodeType, ProgressStepCursor, ReportEntry, SpecReport,
};
use crate::output::Writer;

#[derive(Default)]
struct SelectiveState {
    current_spec_report: SpecReport,
    current_node: Option<Node>,
    current_node_start_time: Option<DateTime<Utc>>,
    progress_step_cursor: ProgressStepCursor,
    current_spec_context: Option<SpecContext>,
}

/// Copy of the cursors taken when a progress report is generated
pub(crate) struct ProgressSnapshot {
    pub report: SpecReport,
    pub node: Option<Node>,
    pub node_start_time: Option<DateTime<Utc>>,
    pub step: ProgressStepCursor,
    pub context: Option<SpecContext>,
}

pub struct SharedState {
    phase: RwLock<Phase>,
    selective: Mutex<SelectiveState>,
    cleanup_nodes: Mutex<Vec<Node>>,
    writer: RwLock<Option<Arc<dyn Writer>>>,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        Self {
            phase: RwLock::new(Phase::BuildTopLevel),
            selective: Mutex::new(SelectiveState::default()),
            cleanup_nodes: Mutex::new(Vec::new()),
            writer: RwLock::new(None),
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        *self.phase.read()
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        let mut current = self.phase.write();
        if phase > *current {
            *current = phase;
        }
    }

    pub(crate) fn set_writer(&self, writer: Arc<dyn Writer>) {
        *self.writer.write() = Some(writer);
    }

    fn writer_output(&self) -> Option<String> {
        let writer = self.writer.read().clone();
        writer.map(|w| String::from_utf8_lossy(&w.bytes()).into_owned())
    }

    /// Copy of the current spec report with the writer's output filled in
    pub(crate) fn current_spec_report(&self) -> SpecReport {
        let mut report = self.selective.lock().current_spec_report.clone();
        if let Some(output) = self.writer_output() {
            report.captured_writer_output = output;
        }
        report
    }

    pub(crate) fn set_current_spec_report(&self, report: SpecReport) {
        self.selective.lock().current_spec_report = report;
    }

    pub(crate) fn update_current_spec_report<R>(&self, f: impl FnOnce(&mut SpecReport) -> R) -> R {
        f(&mut self.selective.lock().current_spec_report)
    }

    /// The current spec report as recorded, without the live writer output
    pub(crate) fn recorded_spec_report(&self) -> SpecReport {
        self.selective.lock().current_spec_report.clone()
    }

    pub(crate) fn add_report_entry(&self, entry: ReportEntry) -> Result<(), SuiteError> {
        if self.phase() != Phase::Run {
            return Err(SuiteError::AddReportEntryNotDuringRunPhase {
                location: entry.location,
            });
        }
        self.selective
            .lock()
            .current_spec_report
            .report_entries
            .push(entry);
        Ok(())
    }

    pub(crate) fn set_progress_step_cursor(&self, cursor: ProgressStepCursor) {
        self.selective.lock().progress_step_cursor = cursor;
    }

    /// Mark `node` as running until the returned guard drops
    pub(crate) fn enter_node(&self, node: &Node) -> NodeCursorGuard<'_> {
        {
            let mut state = self.selective.lock();
            state.current_node = Some(node.clone());
            state.current_node_start_time = Some(Utc::now());
            state.progress_step_cursor = ProgressStepCursor::default();
        }
        NodeCursorGuard { shared: self }
    }

    pub(crate) fn set_current_spec_context(&self, context: SpecContext) {
        self.selective.lock().current_spec_context = Some(context);
    }

    pub(crate) fn progress_snapshot(&self) -> ProgressSnapshot {
        let state = self.selective.lock();
        ProgressSnapshot {
            report: state.current_spec_report.clone(),
            node: state.current_node.clone(),
            node_start_time: state.current_node_start_time,
            step: state.progress_step_cursor.clone(),
            context: state.current_spec_context.clone(),
        }
    }

    pub(crate) fn push_cleanup(&self, mut node: Node) -> Result<(), SuiteError> {
        let location = node.code_location.clone();
        if self.phase() != Phase::Run {
            return Err(SuiteError::PushingCleanupNodeDuringTreeConstruction { location });
        }
        let current = self.selective.lock().current_node.clone();
        let Some(current) = current else {
            return Err(SuiteError::PushingCleanupNodeDuringTreeConstruction { location });
        };

        node.node_type = match current.node_type {
            t if t.is_before_suite() || t.is_after_suite() => NodeType::CleanupAfterSuite,
            NodeType::BeforeAll | NodeType::AfterAll => NodeType::CleanupAfterAll,
            t if t.is_reporting() => {
                return Err(SuiteError::PushingCleanupInReportingNode {
                    location,
                    node_type: t,
                })
            }
            t if t.is_cleanup() => {
                return Err(SuiteError::PushingCleanupInCleanupNode { location });
            }
            _ => NodeType::CleanupAfterEach,
        };
        node.node_id_where_cleanup_was_generated = Some(current.id);
        node.nesting_level = current.nesting_level;
        self.cleanup_nodes.lock().push(node);
        Ok(())
    }

    pub(crate) fn remove_cleanup_node(&self, node: &Node) {
        self.cleanup_nodes.lock().retain(|n| n.id != node.id);
    }

    /// Pending cleanup nodes of `node_type` in registration order
    pub(crate) fn cleanup_nodes_with_type(&self, node_type: NodeType) -> Vec<Node> {
        self.cleanup_nodes
            .lock()
            .iter()
            .filter(|n| n.node_type == node_type)
            .cloned()
            .collect()
    }
}

/// Clears the current node cursors when a node finishes
pub(crate) struct NodeCursorGuard<'a> {
    shared: &'a SharedState,
}

impl Drop for NodeCursorGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.selective.lock();
        state.current_node = None;
        state.current_node_start_time = None;
        state.current_spec_context = None;
    }
}

/// Self-service API for code running inside nodes
///
/// Cloneable and safe to call from any thread, including from work that
/// outlives the node that started it.
#[derive(Clone)]
pub struct SuiteHandle {
    shared: Arc<SharedState>,
}

impl SuiteHandle {
    pub(crate) fn new(shared: Arc<SharedState>) -> Self {
        Self { shared }
    }

    /// Snapshot of the spec currently running; entries are copied
    pub fn current_spec_report(&self) -> SpecReport {
        self.shared.current_spec_report()
    }

    pub fn add_report_entry(&self, entry: ReportEntry) -> Result<(), SuiteError> {
        self.shared.add_report_entry(entry)
    }

    /// Record a step of the running node
    #[track_caller]
    pub fn by(&self, text: impl Into<String>) -> Result<(), SuiteError> {
        let text = text.into();
        let location = CodeLocation::caller();
        let entry = ReportEntry {
            location: location.clone(),
            ..ReportEntry::new("By Step")
        }
        .with_value(serde_json::Value::String(text.clone()));
        self.shared.add_report_entry(entry)?;
        self.shared.set_progress_step_cursor(ProgressStepCursor {
            text,
            location,
            start_time: Some(Utc::now()),
        });
        Ok(())
    }

    /// Register a cleanup body; its kind follows the node that is running
    #[track_caller]
    pub fn defer_cleanup(&self, body: NodeBody) -> Result<(), SuiteError> {
        self.shared.push_cleanup(Node::cleanup(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::BufferedWriter;

    fn running() -> Arc<SharedState> {
        let shared = Arc::new(SharedState::new());
        shared.set_phase(Phase::Run);
        shared
    }

    #[test]
    fn test_phase_never_moves_backwards() {
        let shared = SharedState::new();
        shared.set_phase(Phase::Run);
        shared.set_phase(Phase::BuildTree);
        assert_eq!(shared.phase(), Phase::Run);
    }

    #[test]
    fn test_current_spec_report_is_a_copy() {
        let shared = running();
        let writer = Arc::new(BufferedWriter::new());
        writer.println("progress");
        shared.set_writer(writer);
        let handle = SuiteHandle::new(Arc::clone(&shared));

        handle.add_report_entry(ReportEntry::new("first")).unwrap();
        let mut copy = handle.current_spec_report();
        assert_eq!(copy.captured_writer_output, "progress\n");
        copy.report_entries.push(ReportEntry::new("mutated"));
        copy.report_entries[0].name = "renamed".into();

        let next = handle.current_spec_report();
        assert_eq!(next.report_entries.len(), 1);
        assert_eq!(next.report_entries[0].name, "first");
    }

    #[test]
    fn test_report_entry_rejected_outside_run_phase() {
        let handle = SuiteHandle::new(Arc::new(SharedState::new()));
        let err = handle.add_report_entry(ReportEntry::new("early")).unwrap_err();
        assert!(matches!(err, SuiteError::AddReportEntryNotDuringRunPhase { .. }));
    }

    #[test]
    fn test_cleanup_reclassified_by_running_node() {
        let shared = running();
        let handle = SuiteHandle::new(Arc::clone(&shared));
        let body = || NodeBody::blocking(|| Ok(()));

        let mut before_all = Node::before_all(body());
        before_all.nesting_level = 2;
        {
            let _guard = shared.enter_node(&before_all);
            handle.defer_cleanup(body()).unwrap();
        }
        {
            let _guard = shared.enter_node(&Node::it("leaf", body()));
            handle.defer_cleanup(body()).unwrap();
        }
        {
            let _guard = shared.enter_node(&Node::before_suite(body()));
            handle.defer_cleanup(body()).unwrap();
        }

        let all = shared.cleanup_nodes_with_type(NodeType::CleanupAfterAll);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].node_id_where_cleanup_was_generated, Some(before_all.id));
        assert_eq!(all[0].nesting_level, 2);
        assert_eq!(shared.cleanup_nodes_with_type(NodeType::CleanupAfterEach).len(), 1);
        assert_eq!(shared.cleanup_nodes_with_type(NodeType::CleanupAfterSuite).len(), 1);
    }

    #[test]
    fn test_cleanup_rejected_in_cleanup_and_reporting_nodes() {
        let shared = running();
        let handle = SuiteHandle::new(Arc::clone(&shared));
        let body = || NodeBody::blocking(|| Ok(()));

        let mut cleanup = Node::cleanup(body());
        cleanup.node_type = NodeType::CleanupAfterEach;
        {
            let _guard = shared.enter_node(&cleanup);
            let err = handle.defer_cleanup(body()).unwrap_err();
            assert!(matches!(err, SuiteError::PushingCleanupInCleanupNode { .. }));
        }
        {
            let _guard = shared.enter_node(&Node::report_after_each(|_| Ok(())));
            let err = handle.defer_cleanup(body()).unwrap_err();
            assert!(matches!(err, SuiteError::PushingCleanupInReportingNode { .. }));
        }

        let err = handle.defer_cleanup(body()).unwrap_err();
        assert!(matches!(
            err,
            SuiteError::PushingCleanupNodeDuringTreeConstruction { .. }
        ));
    }

    #[test]
    fn test_by_sets_step_cursor() {
        let shared = running();
        let handle = SuiteHandle::new(Arc::clone(&shared));
        handle.by("connecting").unwrap();

        let snapshot = shared.progress_snapshot();
        assert_eq!(snapshot.step.text, "connecting");
        assert!(snapshot.step.location.file_name.ends_with("shared.rs"));
        assert_eq!(shared.current_spec_report().report_entries[0].name, "By Step");
    }
}
