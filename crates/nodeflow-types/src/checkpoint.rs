//! Serializable workflow checkpoint.
//!
//! A checkpoint captures everything needed to rebuild a workflow execution
//! context: the definition, status, variables, per-node state, the
//! completion log, and every message still sitting in a node queue.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::compensation::CompensationRecord;
use crate::definition::{NodeId, WorkflowDefinition};
use crate::instance::{CompletedActivation, NodeInstance, NodeInstanceState};
use crate::message::Message;
use crate::status::WorkflowStatus;

/// Snapshot of one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    pub instance_id: Uuid,
    pub workflow_id: String,
    pub definition: WorkflowDefinition,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub node_states: HashMap<NodeId, NodeInstanceState>,
    /// Every recorded attempt, oldest first.
    #[serde(default)]
    pub node_instances: Vec<NodeInstance>,
    /// Queue contents per node, in queue order.
    #[serde(default)]
    pub pending_messages: HashMap<NodeId, Vec<PendingMessage>>,
    #[serde(default)]
    pub completion_order: Vec<CompletedActivation>,
    #[serde(default)]
    pub compensations: Vec<CompensationRecord>,
    /// Last epoch handed out by the instance's epoch counter.
    #[serde(default)]
    pub epoch_counter: u64,
    /// Run time consumed before this snapshot. Time spent paused is not
    /// counted, so a workflow timeout keeps its budget across resume.
    #[serde(default)]
    pub run_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_node_id: Option<NodeId>,
}

/// A queued message captured by a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub message: Message,
    /// True if the message was leased when the snapshot was taken.
    #[serde(default)]
    pub in_flight: bool,
}
