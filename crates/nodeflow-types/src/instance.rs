//! Node execution records.
//!
//! A `NodeInstance` records one execution attempt. `NodeInstanceState`
//! aggregates all attempts of a node within one workflow instance and is
//! what checkpoints persist.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::NodeId;
use crate::status::NodeStatus;

// ---------------------------------------------------------------------------
// Error information
// ---------------------------------------------------------------------------

/// Failure taxonomy retained on records for postmortem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NodeExecution,
    Timeout,
    Cancellation,
    CircuitOpen,
    RetryExhausted,
    Persistence,
}

/// Serializable description of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// Free-form category used by retry predicates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl std::fmt::Display for NodeErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

// ---------------------------------------------------------------------------
// NodeInstance
// ---------------------------------------------------------------------------

/// Record of one execution attempt of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    /// Unique id of this attempt (UUIDv7).
    pub id: Uuid,
    pub node_id: NodeId,
    pub epoch: u64,
    /// 1-based attempt number.
    pub attempt: u32,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeErrorInfo>,
    /// Output port the result left through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl NodeInstance {
    /// A running attempt started now.
    pub fn started(node_id: impl Into<NodeId>, epoch: u64, attempt: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            node_id: node_id.into(),
            epoch,
            attempt,
            status: NodeStatus::Running,
            started_at: Some(Utc::now()),
            completed_at: None,
            error: None,
            output_port: None,
            output: None,
        }
    }

    pub fn complete(mut self, output: serde_json::Value, port: Option<String>) -> Self {
        self.status = NodeStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.output = Some(output);
        self.output_port = port;
        self
    }

    pub fn fail(mut self, error: NodeErrorInfo) -> Self {
        self.status = if error.kind == ErrorKind::Cancellation {
            NodeStatus::Cancelled
        } else {
            NodeStatus::Failed
        };
        self.completed_at = Some(Utc::now());
        self.error = Some(error);
        self
    }

    /// Wall-clock duration of the attempt, if finished.
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// NodeInstanceState
// ---------------------------------------------------------------------------

/// Aggregated per-node state within one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInstanceState {
    pub node_id: NodeId,
    pub status: NodeStatus,
    /// Total execution attempts across all epochs.
    #[serde(default)]
    pub attempts: u32,
    /// Epochs in which this node completed.
    #[serde(default)]
    pub completed_epochs: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<NodeErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeInstanceState {
    pub fn pending(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Pending,
            attempts: 0,
            completed_epochs: Vec::new(),
            last_output: None,
            last_error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn has_completed_epoch(&self, epoch: u64) -> bool {
        self.completed_epochs.contains(&epoch)
    }
}

/// One entry of the completion log used to order compensation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedActivation {
    pub node_id: NodeId,
    pub epoch: u64,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub output: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn started_then_completed_records_output_and_port() {
        let inst = NodeInstance::started("router", 2, 1).complete(json!({"ok": true}), Some("yes".into()));
        assert_eq!(inst.status, NodeStatus::Completed);
        assert_eq!(inst.output_port.as_deref(), Some("yes"));
        assert!(inst.completed_at.is_some());
        assert!(inst.duration_ms().is_some());
    }

    #[test]
    fn cancellation_error_marks_cancelled() {
        let inst = NodeInstance::started("slow", 0, 1).fail(NodeErrorInfo {
            kind: ErrorKind::Cancellation,
            message: "cancelled".into(),
            category: None,
        });
        assert_eq!(inst.status, NodeStatus::Cancelled);

        let inst = NodeInstance::started("slow", 0, 1).fail(NodeErrorInfo {
            kind: ErrorKind::Timeout,
            message: "timed out".into(),
            category: None,
        });
        assert_eq!(inst.status, NodeStatus::Failed);
    }

    #[test]
    fn state_tracks_completed_epochs() {
        let mut state = NodeInstanceState::pending("a");
        assert!(!state.has_completed_epoch(0));
        state.completed_epochs.push(0);
        assert!(state.has_completed_epoch(0));
        assert!(!state.has_completed_epoch(1));
    }
}
