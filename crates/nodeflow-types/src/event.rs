//! Lifecycle events published by the engine.
//!
//! Events are best-effort notifications for observers (UIs, telemetry).
//! They are serialized with a `type` tag so they can be forwarded as JSON.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::NodeId;

/// A lifecycle notification for a workflow instance or one of its nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        instance_id: Uuid,
        workflow_id: String,
    },
    WorkflowResumed {
        instance_id: Uuid,
        workflow_id: String,
    },
    WorkflowPaused {
        instance_id: Uuid,
    },
    WorkflowCompleted {
        instance_id: Uuid,
        duration_ms: u64,
    },
    WorkflowFailed {
        instance_id: Uuid,
        failed_node_id: Option<NodeId>,
        error: String,
    },
    WorkflowCancelled {
        instance_id: Uuid,
    },
    NodeStarted {
        instance_id: Uuid,
        node_id: NodeId,
        epoch: u64,
        attempt: u32,
    },
    NodeCompleted {
        instance_id: Uuid,
        node_id: NodeId,
        epoch: u64,
        duration_ms: u64,
    },
    NodeFailed {
        instance_id: Uuid,
        node_id: NodeId,
        epoch: u64,
        error: String,
        will_retry: bool,
    },
    NodeCancelled {
        instance_id: Uuid,
        node_id: NodeId,
        cascade_from_failure: bool,
    },
    Progress {
        instance_id: Uuid,
        node_id: NodeId,
        percent: f32,
        detail: Option<String>,
    },
    CircuitOpened {
        instance_id: Uuid,
        node_id: NodeId,
    },
    CompensationExecuted {
        instance_id: Uuid,
        node_id: NodeId,
        compensation_node_id: NodeId,
        succeeded: bool,
    },
}

impl WorkflowEvent {
    /// The instance the event belongs to.
    pub fn instance_id(&self) -> Uuid {
        match self {
            WorkflowEvent::WorkflowStarted { instance_id, .. }
            | WorkflowEvent::WorkflowResumed { instance_id, .. }
            | WorkflowEvent::WorkflowPaused { instance_id }
            | WorkflowEvent::WorkflowCompleted { instance_id, .. }
            | WorkflowEvent::WorkflowFailed { instance_id, .. }
            | WorkflowEvent::WorkflowCancelled { instance_id }
            | WorkflowEvent::NodeStarted { instance_id, .. }
            | WorkflowEvent::NodeCompleted { instance_id, .. }
            | WorkflowEvent::NodeFailed { instance_id, .. }
            | WorkflowEvent::NodeCancelled { instance_id, .. }
            | WorkflowEvent::Progress { instance_id, .. }
            | WorkflowEvent::CircuitOpened { instance_id, .. }
            | WorkflowEvent::CompensationExecuted { instance_id, .. } => *instance_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_type_tag() {
        let id = Uuid::now_v7();
        let event = WorkflowEvent::NodeFailed {
            instance_id: id,
            node_id: "charge".into(),
            epoch: 0,
            error: "declined".into(),
            will_retry: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "node_failed");
        assert_eq!(json["will_retry"], true);
        assert_eq!(event.instance_id(), id);
    }
}
