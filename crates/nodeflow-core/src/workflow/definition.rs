//! Workflow definition validation.
//!
//! `validate_definition` runs before any instance starts: structural checks,
//! reference checks, policy sanity, and cycle detection. Nothing executes for
//! a definition that fails here.

use std::collections::HashSet;

use nodeflow_types::definition::{
    CircuitBreakerPolicy, NodeDefinition, RetryPolicy, RetryStrategy, WorkflowDefinition,
};

use super::dag::{WorkflowGraph, entry_points};

/// Errors from definition validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    /// Structural or policy validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// The connection graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A connection or handler references an undefined node.
    #[error("unknown node: {0}")]
    UnknownNode(String),
}

/// Validate a definition and build its graph.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<WorkflowGraph, WorkflowError> {
    if def.id.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow id must not be empty".to_string(),
        ));
    }

    if def.nodes.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one node".to_string(),
        ));
    }

    // Unique, non-empty node ids
    let mut seen_ids = HashSet::new();
    for node in &def.nodes {
        if node.id.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "node id must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(node.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate node ID: '{}'",
                node.id
            )));
        }
        if node.node_type.trim().is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "node '{}' has no node_type",
                node.id
            )));
        }
    }

    if let Some(entry) = &def.entry_point {
        if !seen_ids.contains(entry.as_str()) {
            return Err(WorkflowError::UnknownNode(format!(
                "entry point '{entry}' is not defined"
            )));
        }
    }

    for node in &def.nodes {
        validate_handlers(node, &seen_ids)?;
        if let Some(retry) = &node.retry {
            validate_retry(&node.id, retry)?;
        }
        if let Some(breaker) = &node.circuit_breaker {
            validate_breaker(&node.id, breaker)?;
        }
    }

    let graph = WorkflowGraph::build(def)?;
    graph.topological_order()?;

    if entry_points(def).is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow has no entry point".to_string(),
        ));
    }

    Ok(graph)
}

fn validate_handlers(node: &NodeDefinition, ids: &HashSet<&str>) -> Result<(), WorkflowError> {
    for (label, handler) in [
        ("compensation", &node.compensation_node_id),
        ("fallback", &node.fallback_node_id),
    ] {
        let Some(handler) = handler else { continue };
        if handler == &node.id {
            return Err(WorkflowError::ValidationError(format!(
                "node '{}' cannot be its own {label} node",
                node.id
            )));
        }
        if !ids.contains(handler.as_str()) {
            return Err(WorkflowError::UnknownNode(format!(
                "{label} node '{handler}' of node '{}' is not defined",
                node.id
            )));
        }
    }
    Ok(())
}

fn validate_retry(node_id: &str, retry: &RetryPolicy) -> Result<(), WorkflowError> {
    if retry.max_attempts == 0 {
        return Err(WorkflowError::ValidationError(format!(
            "node '{node_id}': retry max_attempts must be at least 1"
        )));
    }
    if retry.strategy == RetryStrategy::Exponential
        && !(retry.multiplier.is_finite() && retry.multiplier >= 1.0)
    {
        return Err(WorkflowError::ValidationError(format!(
            "node '{node_id}': exponential multiplier must be >= 1.0, got {}",
            retry.multiplier
        )));
    }
    Ok(())
}

fn validate_breaker(node_id: &str, policy: &CircuitBreakerPolicy) -> Result<(), WorkflowError> {
    if !(1..=100).contains(&policy.failure_threshold_percent) {
        return Err(WorkflowError::ValidationError(format!(
            "node '{node_id}': failure_threshold_percent must be within 1..=100"
        )));
    }
    if policy.minimum_throughput == 0 || policy.half_open_successes == 0 {
        return Err(WorkflowError::ValidationError(format!(
            "node '{node_id}': minimum_throughput and half_open_successes must be positive"
        )));
    }
    if policy.window_size < policy.minimum_throughput {
        return Err(WorkflowError::ValidationError(format!(
            "node '{node_id}': window_size ({}) is smaller than minimum_throughput ({})",
            policy.window_size, policy.minimum_throughput
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "linear")
            .with_node(NodeDefinition::new("a", "passthrough"))
            .with_node(NodeDefinition::new("b", "passthrough"))
            .connect("a", "b")
    }

    #[test]
    fn valid_definition_passes() {
        assert!(validate_definition(&linear()).is_ok());
    }

    #[test]
    fn empty_workflow_is_rejected() {
        let def = WorkflowDefinition::new("wf", "empty");
        assert!(matches!(
            validate_definition(&def),
            Err(WorkflowError::ValidationError(_))
        ));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let def = linear().with_node(NodeDefinition::new("a", "passthrough"));
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("duplicate node ID: 'a'"));
    }

    #[test]
    fn unknown_compensation_node_is_rejected() {
        let mut def = linear();
        def.nodes[0].compensation_node_id = Some("undo".into());
        assert!(matches!(
            validate_definition(&def),
            Err(WorkflowError::UnknownNode(_))
        ));
    }

    #[test]
    fn self_fallback_is_rejected() {
        let mut def = linear();
        def.nodes[1].fallback_node_id = Some("b".into());
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn unknown_entry_point_is_rejected() {
        let mut def = linear();
        def.entry_point = Some("zzz".into());
        assert!(matches!(
            validate_definition(&def),
            Err(WorkflowError::UnknownNode(_))
        ));
    }

    #[test]
    fn cycle_is_rejected() {
        let def = linear().connect("b", "a");
        assert!(matches!(
            validate_definition(&def),
            Err(WorkflowError::CycleDetected(_))
        ));
    }

    #[test]
    fn bad_policies_are_rejected() {
        let mut def = linear();
        def.nodes[0].retry = Some(RetryPolicy::exponential(0, 100, 2.0));
        assert!(validate_definition(&def).is_err());

        let mut def = linear();
        def.nodes[0].retry = Some(RetryPolicy::exponential(3, 100, 0.5));
        assert!(validate_definition(&def).is_err());

        let mut def = linear();
        def.nodes[0].circuit_breaker = Some(CircuitBreakerPolicy {
            failure_threshold_percent: 0,
            ..CircuitBreakerPolicy::default()
        });
        assert!(validate_definition(&def).is_err());

        let mut def = linear();
        def.nodes[0].circuit_breaker = Some(CircuitBreakerPolicy {
            minimum_throughput: 10,
            window_size: 5,
            ..CircuitBreakerPolicy::default()
        });
        assert!(validate_definition(&def).is_err());
    }
}
