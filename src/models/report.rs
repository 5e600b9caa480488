//! Report models
//!
//! Value records describing the outcome of nodes, specs and suites.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use super::node::{CodeLocation, NodeType};
use crate::config::SuiteConfig;

/// Terminal state of a node or spec
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecState {
    #[default]
    Invalid,
    Pending,
    Skipped,
    Passed,
    Failed,
    Aborted,
    Panicked,
    Interrupted,
    Timedout,
}

impl SpecState {
    /// Failed, Aborted, Panicked, Interrupted or Timedout
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SpecState::Failed
                | SpecState::Aborted
                | SpecState::Panicked
                | SpecState::Interrupted
                | SpecState::Timedout
        )
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            SpecState::Invalid => "?",
            SpecState::Pending => "P",
            SpecState::Skipped => "S",
            SpecState::Passed => "•",
            SpecState::Failed => "✗",
            SpecState::Aborted => "A",
            SpecState::Panicked => "!",
            SpecState::Interrupted => "I",
            SpecState::Timedout => "T",
        }
    }
}

impl fmt::Display for SpecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpecState::Invalid => "INVALID",
            SpecState::Pending => "PENDING",
            SpecState::Skipped => "SKIPPED",
            SpecState::Passed => "PASSED",
            SpecState::Failed => "FAILED",
            SpecState::Aborted => "ABORTED",
            SpecState::Panicked => "PANICKED",
            SpecState::Interrupted => "INTERRUPTED",
            SpecState::Timedout => "TIMEDOUT",
        };
        write!(f, "{s}")
    }
}

/// Where the failing node sits relative to the spec
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureNodeContext {
    #[default]
    Invalid,
    LeafNode,
    TopLevel,
    InContainer { container_index: i32 },
}

/// Structured failure detail
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub message: String,
    pub location: CodeLocation,
    pub forwarded_panic: Option<String>,

    pub failure_node_context: FailureNodeContext,
    pub failure_node_type: Option<NodeType>,
    pub failure_node_location: CodeLocation,

    /// Captured when the node timed out or was interrupted
    pub progress_report: Option<ProgressReport>,
}

impl Failure {
    pub fn is_zero(&self) -> bool {
        self.message.is_empty() && self.location.is_zero() && self.forwarded_panic.is_none()
    }
}

/// Failure recorded after the spec had already failed
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AdditionalFailure {
    pub state: SpecState,
    pub failure: Failure,
}

/// Custom data attached to a spec by code running inside it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub name: String,
    pub location: CodeLocation,
    pub time: DateTime<Utc>,
    pub value: Option<serde_json::Value>,
}

impl ReportEntry {
    #[track_caller]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: CodeLocation::caller(),
            time: Utc::now(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(value);
        self
    }
}

/// Most recent step recorded by the running node
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressStepCursor {
    pub text: String,
    pub location: CodeLocation,
    pub start_time: Option<DateTime<Utc>>,
}

/// Point-in-time snapshot of what the running node is doing
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub message: String,
    pub parallel_process: usize,
    pub running_in_parallel: bool,

    pub container_hierarchy_texts: Vec<String>,
    pub leaf_node_text: String,
    pub leaf_node_location: CodeLocation,
    pub spec_start_time: Option<DateTime<Utc>>,

    pub current_node_type: Option<NodeType>,
    pub current_node_text: String,
    pub current_node_location: CodeLocation,
    pub current_node_start_time: Option<DateTime<Utc>>,

    pub current_step_text: String,
    pub current_step_location: CodeLocation,
    pub current_step_start_time: Option<DateTime<Utc>>,

    pub captured_writer_output: String,
    pub additional_reports: Vec<String>,
}

impl ProgressReport {
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn without_captured_writer_output(mut self) -> Self {
        self.captured_writer_output.clear();
        self
    }

    pub fn is_zero(&self) -> bool {
        self.current_node_type.is_none() && self.leaf_node_text.is_empty()
    }
}

impl fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.message.is_empty() {
            writeln!(f, "{}", self.message)?;
        }
        let mut texts = self.container_hierarchy_texts.clone();
        if !self.leaf_node_text.is_empty() {
            texts.push(self.leaf_node_text.clone());
        }
        writeln!(f, "  {} ({})", texts.join(" "), self.leaf_node_location)?;
        if let Some(node_type) = self.current_node_type {
            writeln!(
                f,
                "  In [{}] {} at {}",
                node_type, self.current_node_text, self.current_node_location
            )?;
        }
        if !self.current_step_text.is_empty() {
            writeln!(
                f,
                "  At [By Step] {} at {}",
                self.current_step_text, self.current_step_location
            )?;
        }
        for report in &self.additional_reports {
            writeln!(f, "  {report}")?;
        }
        Ok(())
    }
}

/// Outcome of one spec or one suite-level node
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecReport {
    pub container_hierarchy_texts: Vec<String>,
    pub container_hierarchy_locations: Vec<CodeLocation>,
    pub leaf_node_type: Option<NodeType>,
    pub leaf_node_location: CodeLocation,
    pub leaf_node_text: String,

    pub state: SpecState,
    pub failure: Failure,
    pub additional_failures: Vec<AdditionalFailure>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub run_time: Duration,
    pub parallel_process: usize,
    pub num_attempts: u32,
    pub is_serial: bool,
    pub is_in_ordered_container: bool,

    pub captured_writer_output: String,
    pub captured_std_out_err: String,
    pub report_entries: Vec<ReportEntry>,
    pub progress_reports: Vec<ProgressReport>,
}

impl SpecReport {
    /// Report for a suite-level node
    pub fn for_node(node_type: NodeType, location: CodeLocation, text: &str, process: usize) -> Self {
        Self {
            leaf_node_type: Some(node_type),
            leaf_node_location: location,
            leaf_node_text: text.to_string(),
            parallel_process: process,
            ..Default::default()
        }
    }

    pub fn full_text(&self) -> String {
        let mut texts = self.container_hierarchy_texts.clone();
        if !self.leaf_node_text.is_empty() {
            texts.push(self.leaf_node_text.clone());
        }
        texts.join(" ")
    }

    pub fn failed(&self) -> bool {
        self.state.is_failure()
    }
}

impl fmt::Display for SpecReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match (self.full_text(), self.leaf_node_type) {
            (text, _) if !text.is_empty() => text,
            (_, Some(node_type)) => format!("[{node_type}]"),
            _ => String::from("<unknown>"),
        };
        write!(
            f,
            "{} {} [{}ms]",
            self.state.symbol(),
            text,
            self.run_time.as_millis()
        )?;
        if self.state.is_failure() && !self.failure.message.is_empty() {
            write!(f, " - {}", self.failure.message)?;
        }
        Ok(())
    }
}

/// Counts computed before the first spec runs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreRunStats {
    pub total_specs: usize,
    pub specs_that_will_run: usize,
}

/// Aggregate outcome of a suite run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub suite_path: String,
    pub suite_description: String,
    pub suite_succeeded: bool,
    pub special_suite_failure_reasons: Vec<String>,
    pub pre_run_stats: PreRunStats,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub run_time: Duration,
    pub suite_config: SuiteConfig,
    pub spec_reports: Vec<SpecReport>,
}

impl Report {
    /// Merge a report from another process into this one
    pub fn add(mut self, other: Report) -> Report {
        self.suite_succeeded = self.suite_succeeded && other.suite_succeeded;

        if let Some(other_start) = other.start_time {
            if self.start_time.map(|s| other_start < s).unwrap_or(true) {
                self.start_time = Some(other_start);
            }
        }
        if let Some(other_end) = other.end_time {
            if self.end_time.map(|e| other_end > e).unwrap_or(true) {
                self.end_time = Some(other_end);
            }
        }

        let mut seen = HashSet::new();
        let reasons: Vec<String> = self
            .special_suite_failure_reasons
            .drain(..)
            .chain(other.special_suite_failure_reasons)
            .filter(|reason| seen.insert(reason.clone()))
            .collect();
        self.special_suite_failure_reasons = reasons;

        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            self.run_time = (end - start).to_std().unwrap_or_default();
        }

        self.spec_reports.extend(other.spec_reports);
        self
    }

    pub fn count_with_state(&self, predicate: impl Fn(SpecState) -> bool) -> usize {
        self.spec_reports
            .iter()
            .filter(|r| predicate(r.state))
            .count()
    }
}
