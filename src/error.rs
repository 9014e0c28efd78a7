//! Error types for workflow orchestration
//!
//! Every engine entry point returns [`Result`], so callers can tell a missing
//! template from a gateway dead end or a store failure without parsing text.

use thiserror::Error;

use crate::execution::handler::HandlerError;
use crate::store::{StoreError, TaskStatus};

/// Error type for explosion and task state transitions
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// No single default template with this name
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    /// Template has zero or several start nodes
    #[error("template '{0}' must have exactly one start node")]
    StartNodeMissing(String),

    /// Start node leads only to end nodes (or nowhere)
    #[error("template '{0}' has no task reachable from its start node")]
    NoReachableNode(String),

    /// Gateway routing table produced no target
    #[error("gateway '{node}' of task {task_id} matched no routing entry")]
    NoRouteMatched { task_id: i64, node: String },

    /// Template failed structural validation
    #[error("invalid template '{name}': {reason}")]
    InvalidTemplate { name: String, reason: String },

    /// Role or user name could not be resolved; logged and skipped
    #[error("task {task_id}: cannot resolve {kind} '{name}'")]
    AssignmentResolutionFailed {
        task_id: i64,
        kind: &'static str,
        name: String,
    },

    /// Handler invocation failed, timed out or panicked
    #[error("handler '{handler}' failed for task {task_id}: {source}")]
    HandlerExecutionFailed {
        task_id: i64,
        handler: String,
        #[source]
        source: HandlerError,
    },

    #[error("task not found: {0}")]
    TaskNotFound(i64),

    #[error("workflow entity not found: {0}")]
    EntityNotFound(i64),

    /// Node referenced by a task is missing from the entity's template snapshot
    #[error("node '{node}' not found in template snapshot of entity {entity_id}")]
    NodeNotFound { entity_id: i64, node: String },

    /// Task is not in a state that allows the requested transition
    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: i64,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// A fan-out branch thread panicked before reporting a result
    #[error("branch for node '{0}' panicked")]
    BranchPanicked(String),

    /// Relational store or transaction failure; retry the whole operation
    #[error("transaction failed: {0}")]
    Transaction(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for workflow operations
pub type Result<T> = std::result::Result<T, WorkflowError>;
