//! Saga compensation context handed to compensation nodes.

use serde::{Deserialize, Serialize};

use crate::definition::NodeId;

/// Describes a terminal failure and the completed nodes to undo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationContext {
    pub failed_node_id: NodeId,
    /// The original failure message. Never replaced by compensation errors.
    pub failure: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_output: Option<serde_json::Value>,
    /// Most recently completed first.
    pub nodes_to_compensate: Vec<NodeId>,
    /// True when the walk was restricted to ancestors of the failed node.
    pub partial: bool,
}

/// Outcome of a single compensation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRecord {
    /// The completed node being undone.
    pub node_id: NodeId,
    /// The node that performed the undo.
    pub compensation_node_id: NodeId,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
