//! Saga compensation.
//!
//! When a node fails terminally, completed nodes are undone newest-first by
//! running their configured compensation node. With `partial_compensation`
//! the walk is restricted to ancestors of the failed node.
//!
//! Compensation failures are recorded and logged. They never trigger another
//! round of compensation and never replace the original failure.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use nodeflow_types::compensation::{CompensationContext, CompensationRecord};
use nodeflow_types::definition::{NodeId, WorkflowDefinition};
use nodeflow_types::event::WorkflowEvent;
use nodeflow_types::instance::{CompletedActivation, NodeInstance};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::node::{BoxNode, NodeError, NodeExecutionContext};

use super::context::WorkflowExecutionContext;
use super::dag::WorkflowGraph;

/// Build the compensation context for a failed node.
///
/// `nodes_to_compensate` is the reverse of completion order, each node listed
/// once at its most recent completion, and only nodes that declare a
/// compensation node.
pub fn build_compensation_context(
    definition: &WorkflowDefinition,
    graph: &WorkflowGraph,
    completion_order: &[CompletedActivation],
    failed_node_id: &str,
    failure: &str,
    partial_output: Option<Value>,
) -> CompensationContext {
    let partial = definition.partial_compensation;
    let ancestors = if partial {
        graph.ancestors(failed_node_id)
    } else {
        HashSet::new()
    };

    let mut seen = HashSet::new();
    let nodes_to_compensate = completion_order
        .iter()
        .rev()
        .map(|a| a.node_id.as_str())
        .filter(|id| *id != failed_node_id)
        .filter(|id| seen.insert(*id))
        .filter(|id| !partial || ancestors.contains(*id))
        .filter(|id| {
            definition
                .node(id)
                .is_some_and(|n| n.compensation_node_id.is_some())
        })
        .map(str::to_string)
        .collect();

    CompensationContext {
        failed_node_id: failed_node_id.to_string(),
        failure: failure.to_string(),
        partial_output,
        nodes_to_compensate,
        partial,
    }
}

/// Run every compensation node listed in `context`, sequentially.
///
/// Each compensation node receives `{ "compensation": <context>, "node_id":
/// <compensated node>, "output": <its last output> }`. Runs under a fresh
/// cancellation token since the instance token is already cancelled when a
/// failure halts execution.
pub async fn run_compensation(
    workflow: &WorkflowExecutionContext,
    nodes: &HashMap<NodeId, Arc<BoxNode>>,
    context: &CompensationContext,
) -> Vec<CompensationRecord> {
    let instance_id = workflow.instance_id();
    let context_value = serde_json::to_value(context).unwrap_or(Value::Null);
    let mut records = Vec::with_capacity(context.nodes_to_compensate.len());

    for node_id in &context.nodes_to_compensate {
        let Some(compensation_node_id) = workflow
            .definition()
            .node(node_id)
            .and_then(|n| n.compensation_node_id.clone())
        else {
            continue;
        };
        let Some(handler) = nodes.get(&compensation_node_id) else {
            tracing::error!(%instance_id, node_id = %node_id, compensation_node_id = %compensation_node_id, "compensation node not instantiated");
            continue;
        };

        let output = workflow
            .node_state(node_id)
            .and_then(|s| s.last_output)
            .unwrap_or(Value::Null);
        let input = json!({
            "compensation": context_value,
            "node_id": node_id,
            "output": output,
        });
        let timeout = workflow
            .definition()
            .node(&compensation_node_id)
            .and_then(|n| n.timeout_ms)
            .map(Duration::from_millis)
            .or(workflow.default_node_timeout());

        let mut node_ctx = NodeExecutionContext::new(instance_id, compensation_node_id.clone(), 0, input);
        let record = NodeInstance::started(compensation_node_id.clone(), 0, 1);
        let execution = handler.execute(workflow, &mut node_ctx, CancellationToken::new());
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, execution)
                .await
                .unwrap_or(Err(NodeError::Timeout(limit))),
            None => execution.await,
        };

        let (succeeded, error) = match result {
            Ok(()) => {
                workflow.record_instance(record.complete(node_ctx.output_data.clone(), None));
                tracing::info!(%instance_id, node_id = %node_id, compensation_node_id = %compensation_node_id, "compensation executed");
                (true, None)
            }
            Err(err) => {
                workflow.record_instance(record.fail(err.to_info()));
                tracing::error!(%instance_id, node_id = %node_id, compensation_node_id = %compensation_node_id, error = %err, "compensation failed");
                (false, Some(err.to_string()))
            }
        };

        workflow.publish(WorkflowEvent::CompensationExecuted {
            instance_id,
            node_id: node_id.clone(),
            compensation_node_id: compensation_node_id.clone(),
            succeeded,
        });
        records.push(CompensationRecord {
            node_id: node_id.clone(),
            compensation_node_id,
            succeeded,
            error,
        });
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nodeflow_types::definition::NodeDefinition;

    fn saga(partial: bool) -> WorkflowDefinition {
        let mut def = WorkflowDefinition::new("wf", "saga")
            .with_node(NodeDefinition::new("step1", "passthrough").with_compensation("undo1"))
            .with_node(NodeDefinition::new("step2", "passthrough").with_compensation("undo2"))
            .with_node(NodeDefinition::new("side", "passthrough").with_compensation("undo_side"))
            .with_node(NodeDefinition::new("plain", "passthrough"))
            .with_node(NodeDefinition::new("step3", "passthrough"))
            .with_node(NodeDefinition::new("undo1", "passthrough"))
            .with_node(NodeDefinition::new("undo2", "passthrough"))
            .with_node(NodeDefinition::new("undo_side", "passthrough"))
            .connect("step1", "step2")
            .connect("step2", "step3")
            .connect("step1", "plain")
            .connect("plain", "side");
        def.partial_compensation = partial;
        def
    }

    fn completed(ids: &[&str]) -> Vec<CompletedActivation> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| CompletedActivation {
                node_id: id.to_string(),
                epoch: i as u64,
                completed_at: Utc::now(),
                output: Value::Null,
            })
            .collect()
    }

    #[test]
    fn full_compensation_is_reverse_completion_order() {
        let def = saga(false);
        let graph = WorkflowGraph::build(&def).unwrap();
        let ctx = build_compensation_context(
            &def,
            &graph,
            &completed(&["step1", "plain", "step2", "side"]),
            "step3",
            "boom",
            None,
        );
        assert_eq!(ctx.nodes_to_compensate, vec!["side", "step2", "step1"]);
        assert!(!ctx.partial);
        assert_eq!(ctx.failure, "boom");
    }

    #[test]
    fn partial_compensation_only_walks_ancestors() {
        let def = saga(true);
        let graph = WorkflowGraph::build(&def).unwrap();
        let ctx = build_compensation_context(
            &def,
            &graph,
            &completed(&["step1", "plain", "step2", "side"]),
            "step3",
            "boom",
            Some(json!({"half": true})),
        );
        assert_eq!(ctx.nodes_to_compensate, vec!["step2", "step1"]);
        assert!(ctx.partial);
        assert_eq!(ctx.partial_output, Some(json!({"half": true})));
    }

    #[test]
    fn repeated_completions_are_listed_once_at_latest_position() {
        let def = saga(false);
        let graph = WorkflowGraph::build(&def).unwrap();
        let ctx = build_compensation_context(
            &def,
            &graph,
            &completed(&["step2", "step1", "step2"]),
            "step3",
            "boom",
            None,
        );
        assert_eq!(ctx.nodes_to_compensate, vec!["step2", "step1"]);
    }
}
