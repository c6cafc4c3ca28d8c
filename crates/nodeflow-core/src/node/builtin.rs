//! Builtin node types available through `NodeRegistry::with_builtins`.
//!
//! - `passthrough` -- forwards its input unchanged
//! - `for_each` -- emits one `Next` message per array element, then completes
//! - `delay` -- waits `config.delay_ms`, observing cancellation

use std::time::Duration;

use nodeflow_types::definition::NodeDefinition;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::workflow::context::WorkflowExecutionContext;

use super::{Node, NodeError, NodeExecutionContext};

// ---------------------------------------------------------------------------
// PassthroughNode
// ---------------------------------------------------------------------------

/// Copies `input_data` to `output_data`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughNode;

impl PassthroughNode {
    pub const TYPE: &'static str = "passthrough";
}

impl Node for PassthroughNode {
    async fn execute(
        &self,
        _workflow: &WorkflowExecutionContext,
        node: &mut NodeExecutionContext,
        _cancel: CancellationToken,
    ) -> Result<(), NodeError> {
        node.output_data = node.input_data.clone();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ForEachNode
// ---------------------------------------------------------------------------

/// Iterates an array and emits each element as a `Next` message.
///
/// The array is the input itself, or `input[items_field]` when
/// `config.items_field` is set. Iteration stays inside the node so the graph
/// remains acyclic; downstream nodes connected on `Next` run once per item
/// and nodes connected on `Complete` run once after the loop.
#[derive(Debug, Default, Clone)]
pub struct ForEachNode {
    items_field: Option<String>,
}

impl ForEachNode {
    pub const TYPE: &'static str = "for_each";
}

impl Node for ForEachNode {
    fn initialize(&mut self, definition: &NodeDefinition) -> Result<(), NodeError> {
        self.items_field = match definition.config.get("items_field") {
            None | Some(Value::Null) => None,
            Some(Value::String(field)) => Some(field.clone()),
            Some(other) => {
                return Err(NodeError::Initialization(format!(
                    "items_field must be a string, got {other}"
                )));
            }
        };
        Ok(())
    }

    async fn execute(
        &self,
        _workflow: &WorkflowExecutionContext,
        node: &mut NodeExecutionContext,
        cancel: CancellationToken,
    ) -> Result<(), NodeError> {
        let source = match &self.items_field {
            Some(field) => node.input_data.get(field).cloned().unwrap_or(Value::Null),
            None => node.input_data.clone(),
        };
        let items = match source {
            Value::Array(items) => items,
            other => {
                return Err(NodeError::categorized(
                    format!("for_each expects an array, got {other}"),
                    "input",
                ));
            }
        };

        let total = items.len();
        for (index, item) in items.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(NodeError::Cancelled);
            }
            node.emit_next(index as u64, item);
            if total > 0 {
                node.report_progress(((index + 1) as f32 / total as f32) * 100.0, None);
            }
        }

        node.output_data = json!({ "count": total });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DelayNode
// ---------------------------------------------------------------------------

/// Sleeps for `config.delay_ms` then forwards its input.
#[derive(Debug, Default, Clone)]
pub struct DelayNode {
    delay: Duration,
}

impl DelayNode {
    pub const TYPE: &'static str = "delay";
}

impl Node for DelayNode {
    fn initialize(&mut self, definition: &NodeDefinition) -> Result<(), NodeError> {
        self.delay = match definition.config.get("delay_ms") {
            None | Some(Value::Null) => Duration::ZERO,
            Some(value) => value.as_u64().map(Duration::from_millis).ok_or_else(|| {
                NodeError::Initialization(format!(
                    "delay_ms must be a non-negative integer, got {value}"
                ))
            })?,
        };
        Ok(())
    }

    async fn execute(
        &self,
        _workflow: &WorkflowExecutionContext,
        node: &mut NodeExecutionContext,
        cancel: CancellationToken,
    ) -> Result<(), NodeError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(NodeError::Cancelled),
            _ = tokio::time::sleep(self.delay) => {
                node.output_data = node.input_data.clone();
                Ok(())
            }
        }
    }
}
