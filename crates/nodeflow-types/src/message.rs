//! Messages exchanged between nodes.
//!
//! Every node activation produces messages; the router delivers them to the
//! queues of downstream nodes. A message is immutable once created and is
//! shared read-only between all of its deliveries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::NodeId;

/// Producer id used for the messages that seed entry-point nodes.
pub const WORKFLOW_START: &str = "$start";

/// Discriminant of a [`MessagePayload`], also used as a connection trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Complete,
    Fail,
    Progress,
    Next,
    Cancel,
}

/// A message produced by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id (UUIDv7).
    pub id: Uuid,
    /// Node that produced the message.
    pub node_id: NodeId,
    pub timestamp: DateTime<Utc>,
    /// Activation epoch. Join bookkeeping is scoped per epoch.
    pub epoch: u64,
    pub payload: MessagePayload,
}

/// Variant data carried by a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    /// The node finished successfully.
    Complete {
        output: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<String>,
    },
    /// The node failed after exhausting its retry policy.
    Fail {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
    },
    /// Intermediate progress report.
    Progress {
        percent: f32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// One iteration of a loop-style node.
    Next {
        iteration: u64,
        output: serde_json::Value,
    },
    /// Cancellation propagated downstream.
    Cancel { cascade_from_failure: bool },
}

impl MessagePayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessagePayload::Complete { .. } => MessageKind::Complete,
            MessagePayload::Fail { .. } => MessageKind::Fail,
            MessagePayload::Progress { .. } => MessageKind::Progress,
            MessagePayload::Next { .. } => MessageKind::Next,
            MessagePayload::Cancel { .. } => MessageKind::Cancel,
        }
    }
}

impl Message {
    /// Create a message with a fresh id and the current timestamp.
    pub fn new(node_id: impl Into<NodeId>, epoch: u64, payload: MessagePayload) -> Self {
        Self {
            id: Uuid::now_v7(),
            node_id: node_id.into(),
            timestamp: Utc::now(),
            epoch,
            payload,
        }
    }

    pub fn complete(
        node_id: impl Into<NodeId>,
        epoch: u64,
        output: serde_json::Value,
        port: Option<String>,
    ) -> Self {
        Self::new(node_id, epoch, MessagePayload::Complete { output, port })
    }

    pub fn fail(
        node_id: impl Into<NodeId>,
        epoch: u64,
        error: impl Into<String>,
        category: Option<String>,
    ) -> Self {
        Self::new(
            node_id,
            epoch,
            MessagePayload::Fail {
                error: error.into(),
                category,
            },
        )
    }

    pub fn progress(
        node_id: impl Into<NodeId>,
        epoch: u64,
        percent: f32,
        detail: Option<String>,
    ) -> Self {
        Self::new(node_id, epoch, MessagePayload::Progress { percent, detail })
    }

    pub fn next(
        node_id: impl Into<NodeId>,
        epoch: u64,
        iteration: u64,
        output: serde_json::Value,
    ) -> Self {
        Self::new(node_id, epoch, MessagePayload::Next { iteration, output })
    }

    pub fn cancel(node_id: impl Into<NodeId>, epoch: u64, cascade_from_failure: bool) -> Self {
        Self::new(node_id, epoch, MessagePayload::Cancel { cascade_from_failure })
    }

    /// The seed delivered to an entry-point node at epoch 0.
    pub fn seed(input: serde_json::Value) -> Self {
        Self::complete(WORKFLOW_START, 0, input, None)
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn is_seed(&self) -> bool {
        self.node_id == WORKFLOW_START
    }

    /// The data a consuming node receives as input.
    pub fn data(&self) -> serde_json::Value {
        match &self.payload {
            MessagePayload::Complete { output, .. } => output.clone(),
            MessagePayload::Next { output, .. } => output.clone(),
            MessagePayload::Fail { error, category } => serde_json::json!({
                "error": error,
                "category": category,
                "source": self.node_id,
            }),
            MessagePayload::Progress { percent, detail } => serde_json::json!({
                "percent": percent,
                "detail": detail,
                "source": self.node_id,
            }),
            MessagePayload::Cancel {
                cascade_from_failure,
            } => serde_json::json!({
                "cancelled_by": self.node_id,
                "cascade_from_failure": cascade_from_failure,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_serializes_with_type_tag() {
        let msg = Message::fail("charge", 3, "card declined", Some("payment".into()));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["payload"]["type"], "fail");
        assert_eq!(value["payload"]["error"], "card declined");
        assert_eq!(value["epoch"], 3);
    }

    #[test]
    fn kind_matches_payload() {
        assert_eq!(Message::seed(json!(1)).kind(), MessageKind::Complete);
        assert_eq!(Message::next("loop", 1, 0, json!(1)).kind(), MessageKind::Next);
        assert_eq!(Message::cancel("a", 0, true).kind(), MessageKind::Cancel);
        assert_eq!(
            Message::progress("a", 0, 50.0, None).kind(),
            MessageKind::Progress
        );
    }

    #[test]
    fn seed_comes_from_workflow_start() {
        let seed = Message::seed(json!({"order": 7}));
        assert!(seed.is_seed());
        assert_eq!(seed.epoch, 0);
        assert_eq!(seed.data(), json!({"order": 7}));
    }

    #[test]
    fn fail_data_carries_error_and_source() {
        let msg = Message::fail("charge", 0, "boom", None);
        let data = msg.data();
        assert_eq!(data["error"], "boom");
        assert_eq!(data["source"], "charge");
    }

    #[test]
    fn message_ids_are_unique() {
        let a = Message::seed(json!(null));
        let b = Message::seed(json!(null));
        assert_ne!(a.id, b.id);
    }
}
