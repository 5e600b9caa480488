//! Data models for the spec engine
//!
//! This module contains the node, spec and report records shared by the
//! suite lifecycle and the executor.

mod body;
mod node;
mod report;
mod spec;

pub use body::{
    Body, BodyError, BodyResult, ContainerBody, DataBody, NodeBody, PayloadBody,
    ReportAfterSuiteBody, ReportEachBody,
};
pub use node::{
    CodeLocation, Node, NodeType, NodesExt, SynchronizedAfterSuiteBodies,
    SynchronizedBeforeSuiteBodies,
};
pub use report::{
    AdditionalFailure, Failure, FailureNodeContext, PreRunStats, ProgressReport,
    ProgressStepCursor, Report, ReportEntry, SpecReport, SpecState,
};
pub use spec::Spec;
