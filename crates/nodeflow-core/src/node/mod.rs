//! The node contract and its supporting types.
//!
//! - `Node` -- RPITIT trait every unit of work implements
//! - `context` -- `NodeExecutionContext`, the per-execution scratch space
//! - `box_node` -- object-safe `BoxNode` wrapper for runtime selection
//! - `registry` -- type-name to factory mapping populated at startup
//! - `builtin` -- passthrough, for-each and delay nodes

pub mod box_node;
pub mod builtin;
pub mod context;
pub mod registry;

use std::time::Duration;

use nodeflow_types::definition::{NodeDefinition, NodeId};
use nodeflow_types::instance::{ErrorKind, NodeErrorInfo};
use tokio_util::sync::CancellationToken;

use crate::workflow::context::WorkflowExecutionContext;

pub use box_node::BoxNode;
pub use context::{NodeExecutionContext, SignalSink};
pub use registry::{NodeRegistry, RegistryError};

// ---------------------------------------------------------------------------
// Node trait
// ---------------------------------------------------------------------------

/// A unit of work in a workflow graph.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for `execute`.
/// Implementations read `node.input_data`, write `node.output_data`, and may
/// pick an output port. Returning `Err` hands the failure to the node's
/// retry policy; the engine never inspects business logic.
///
/// Cancellation is cooperative: long-running bodies should observe `cancel`
/// and return [`NodeError::Cancelled`].
pub trait Node: Send + Sync {
    /// Configure the node from its definition. Called once per instance.
    fn initialize(&mut self, definition: &NodeDefinition) -> Result<(), NodeError> {
        let _ = definition;
        Ok(())
    }

    /// Execute one attempt.
    fn execute(
        &self,
        workflow: &WorkflowExecutionContext,
        node: &mut NodeExecutionContext,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = Result<(), NodeError>> + Send;

    /// Output port names. Empty means a single default port.
    fn available_ports(&self) -> Vec<String> {
        Vec::new()
    }

    /// Extra veto on retrying a failed attempt, checked after the node's
    /// retry policy has allowed it.
    fn should_retry(&self, _error: &NodeError) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// NodeError
// ---------------------------------------------------------------------------

/// Failure of a node attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NodeError {
    /// The node body reported a failure.
    #[error("{message}")]
    Execution {
        message: String,
        category: Option<String>,
    },

    /// The attempt exceeded its timeout.
    #[error("node timed out after {0:?}")]
    Timeout(Duration),

    /// Cooperative cancellation was observed.
    #[error("node execution cancelled")]
    Cancelled,

    /// Rejected by an open circuit without running the body.
    #[error("circuit open for node '{0}'")]
    CircuitOpen(NodeId),

    /// Every allowed attempt failed.
    #[error("retry exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<NodeError> },

    /// `initialize` rejected the definition.
    #[error("initialization failed: {0}")]
    Initialization(String),
}

impl NodeError {
    /// An uncategorized execution failure.
    pub fn execution(message: impl Into<String>) -> Self {
        NodeError::Execution {
            message: message.into(),
            category: None,
        }
    }

    /// An execution failure tagged with a category for retry predicates.
    pub fn categorized(message: impl Into<String>, category: impl Into<String>) -> Self {
        NodeError::Execution {
            message: message.into(),
            category: Some(category.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::Execution { .. } => ErrorKind::NodeExecution,
            NodeError::Timeout(_) => ErrorKind::Timeout,
            NodeError::Cancelled => ErrorKind::Cancellation,
            NodeError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            NodeError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            NodeError::Initialization(_) => ErrorKind::Validation,
        }
    }

    /// Category used by `RetryPolicy::retry_on`.
    ///
    /// Timeouts report `"timeout"`; exhausted retries report the category of
    /// the last underlying failure.
    pub fn category(&self) -> Option<&str> {
        match self {
            NodeError::Execution { category, .. } => category.as_deref(),
            NodeError::Timeout(_) => Some("timeout"),
            NodeError::RetryExhausted { last, .. } => last.category(),
            _ => None,
        }
    }

    /// Whether a retry policy may re-run the node after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Execution { .. } | NodeError::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, NodeError::Cancelled)
    }

    pub fn to_info(&self) -> NodeErrorInfo {
        NodeErrorInfo {
            kind: self.kind(),
            message: self.to_string(),
            category: self.category().map(str::to_string),
        }
    }
}
