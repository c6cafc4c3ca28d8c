//! BoxNode -- object-safe dynamic dispatch wrapper for `Node`.
//!
//! 1. `NodeDyn` is an object-safe mirror of `Node` with boxed futures
//! 2. Blanket-impl `NodeDyn` for all `T: Node`
//! 3. `BoxNode` wraps `Box<dyn NodeDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use nodeflow_types::definition::NodeDefinition;
use tokio_util::sync::CancellationToken;

use crate::workflow::context::WorkflowExecutionContext;

use super::{Node, NodeError, NodeExecutionContext};

/// Object-safe version of [`Node`] with boxed futures.
pub trait NodeDyn: Send + Sync {
    fn initialize_dyn(&mut self, definition: &NodeDefinition) -> Result<(), NodeError>;

    fn execute_boxed<'a>(
        &'a self,
        workflow: &'a WorkflowExecutionContext,
        node: &'a mut NodeExecutionContext,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), NodeError>> + Send + 'a>>;

    fn available_ports_dyn(&self) -> Vec<String>;

    fn should_retry_dyn(&self, error: &NodeError) -> bool;
}

impl<T: Node> NodeDyn for T {
    fn initialize_dyn(&mut self, definition: &NodeDefinition) -> Result<(), NodeError> {
        Node::initialize(self, definition)
    }

    fn execute_boxed<'a>(
        &'a self,
        workflow: &'a WorkflowExecutionContext,
        node: &'a mut NodeExecutionContext,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), NodeError>> + Send + 'a>> {
        Box::pin(self.execute(workflow, node, cancel))
    }

    fn available_ports_dyn(&self) -> Vec<String> {
        Node::available_ports(self)
    }

    fn should_retry_dyn(&self, error: &NodeError) -> bool {
        Node::should_retry(self, error)
    }
}

/// Type-erased node selected at runtime by the registry.
///
/// Since `Node` uses RPITIT, it cannot be used as a trait object directly.
pub struct BoxNode {
    inner: Box<dyn NodeDyn + Send + Sync>,
}

impl BoxNode {
    pub fn new<T: Node + 'static>(node: T) -> Self {
        Self {
            inner: Box::new(node),
        }
    }

    pub fn initialize(&mut self, definition: &NodeDefinition) -> Result<(), NodeError> {
        self.inner.initialize_dyn(definition)
    }

    pub async fn execute(
        &self,
        workflow: &WorkflowExecutionContext,
        node: &mut NodeExecutionContext,
        cancel: CancellationToken,
    ) -> Result<(), NodeError> {
        self.inner.execute_boxed(workflow, node, cancel).await
    }

    pub fn available_ports(&self) -> Vec<String> {
        self.inner.available_ports_dyn()
    }

    pub fn should_retry(&self, error: &NodeError) -> bool {
        self.inner.should_retry_dyn(error)
    }
}

impl std::fmt::Debug for BoxNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxNode")
            .field("ports", &self.available_ports())
            .finish()
    }
}
