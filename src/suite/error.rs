//! Suite construction and coordination errors

use thiserror::Error;

use crate::models::{CodeLocation, NodeType};
use crate::parallel::ParallelError;

/// Errors raised while registering nodes or coordinating suite nodes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SuiteError {
    #[error("{node_type} pushed during the run phase at {location}")]
    PushingNodeInRunPhase {
        node_type: NodeType,
        location: CodeLocation,
    },

    #[error("{node_type} must be registered at the top level, not inside a container, at {location}")]
    SuiteNodeInNestedContext {
        node_type: NodeType,
        location: CodeLocation,
    },

    #[error("{node_type} registered during the run phase at {location}")]
    SuiteNodeDuringRunPhase {
        node_type: NodeType,
        location: CodeLocation,
    },

    #[error("more than one BeforeSuite node: {location} and {existing}")]
    MultipleBeforeSuiteNodes {
        location: CodeLocation,
        existing: CodeLocation,
    },

    #[error("more than one AfterSuite node: {location} and {existing}")]
    MultipleAfterSuiteNodes {
        location: CodeLocation,
        existing: CodeLocation,
    },

    #[error("serial node at {location} is nested in an ordered container that is not serial")]
    InvalidSerialNodeInNonSerialOrderedContainer { location: CodeLocation },

    #[error("{node_type} at {location} must be inside an ordered container")]
    SetupNodeNotInOrderedContainer {
        node_type: NodeType,
        location: CodeLocation,
    },

    #[error("caught panic while building the container at {location}: {message}")]
    CaughtPanicDuringABuildPhase {
        message: String,
        location: CodeLocation,
    },

    #[error("cleanup at {location} can only be registered while a node is running")]
    PushingCleanupNodeDuringTreeConstruction { location: CodeLocation },

    #[error("cleanup at {location} cannot be registered from a {node_type} node")]
    PushingCleanupInReportingNode {
        location: CodeLocation,
        node_type: NodeType,
    },

    #[error("cleanup at {location} cannot be registered from another cleanup node")]
    PushingCleanupInCleanupNode { location: CodeLocation },

    #[error("report entry at {location} added outside the run phase")]
    AddReportEntryNotDuringRunPhase { location: CodeLocation },

    #[error("SynchronizedBeforeSuite failed on proc 1")]
    SynchronizedBeforeSuiteFailedOnProc1,

    #[error(transparent)]
    Parallel(#[from] ParallelError),
}
