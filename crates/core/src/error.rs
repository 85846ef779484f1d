//! Error types for graph validation, scheduling, and node processors.

use crate::types::{ExecutionId, NodeType};
use crate::workflow::validator::ValidationReport;

/// Errors returned by the execution engine itself.
///
/// Node-level failures never surface here; they end up on the node's
/// `error` field inside the returned plan.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The graph failed structural validation and was not scheduled.
    #[error("Workflow validation failed with {} error(s)", .0.errors.len())]
    Validation(Box<ValidationReport>),

    /// The execution configuration is out of bounds.
    #[error("Invalid execution configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// The graph could not be turned into a DAG.
    #[error("Invalid workflow graph: {0}")]
    Graph(String),

    /// No run with this id is in flight.
    #[error("Execution {0} is not active")]
    NotActive(ExecutionId),
}

/// Bounds violations of the execution configuration surface.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("maxConcurrency must be at least 1 (got {0})")]
    MaxConcurrency(usize),

    #[error("timeout must be at least 1000ms (got {0}ms)")]
    Timeout(u64),

    #[error("retryDelay must be at least 100ms (got {0}ms)")]
    RetryDelay(u64),

    #[error("backoffMultiplier must be at least 1 (got {0})")]
    BackoffMultiplier(f64),
}

/// Failure of a single node invocation.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// The processor ran and reported a failure.
    #[error("{0}")]
    Failed(String),

    /// Nothing is registered to run this node type.
    #[error("No processor registered for node type {0}")]
    MissingProcessor(NodeType),

    /// The resolved configuration was rejected.
    #[error("Invalid node configuration: {0}")]
    InvalidConfig(String),

    /// The run was cancelled or timed out while the node was in flight.
    #[error("Node execution cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProcessorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Check if another attempt could succeed.
    ///
    /// A rejected configuration resolves the same way every time, and a
    /// cancelled node has no run left to retry into.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Failed(_) | Self::Other(_) => true,
            Self::MissingProcessor(_) | Self::InvalidConfig(_) | Self::Cancelled => false,
        }
    }
}
