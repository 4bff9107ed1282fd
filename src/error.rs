//! Engine Error Types
//!
//! A single error enum covers everything the engine can surface to a
//! caller: malformed definitions, node failures, timeouts, merge deadlocks
//! and illegal lifecycle transitions.

use thiserror::Error;

use crate::workflow::state::InstanceStatus;

/// Errors produced by the workflow engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The definition graph is malformed (dangling edges, unreachable nodes, cycles).
    #[error("Invalid workflow definition: {0}")]
    DefinitionInvalid(String),

    /// An executor or task delegate failed for a node.
    #[error("Node '{node_id}' failed: {message}")]
    NodeExecution { node_id: String, message: String },

    /// A node stayed active longer than its configured timeout.
    #[error("Node '{node_id}' timed out after {timeout_ms} ms")]
    Timeout { node_id: String, timeout_ms: u64 },

    /// Nodes are waiting on predecessors that can never complete.
    #[error("Dependency deadlock: nodes {node_ids:?} can never become ready")]
    DependencyDeadlock { node_ids: Vec<String> },

    #[error("Workflow instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("Workflow definition '{0}' not found")]
    DefinitionNotFound(String),

    /// A lifecycle operation was requested in a status that does not allow it.
    #[error("Cannot {operation} instance '{instance_id}' in status {status}")]
    InvalidTransition {
        instance_id: String,
        operation: &'static str,
        status: InstanceStatus,
    },

    /// A decision condition could not be parsed or evaluated.
    #[error("Condition error: {0}")]
    Expression(String),

    /// An external task delegate reported a failure.
    #[error("Delegate error: {0}")]
    Delegate(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Builds a node execution error.
    pub fn node(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NodeExecution {
            node_id: node_id.into(),
            message: message.into(),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
