//! Bounded dead-letter queue.
//!
//! Holds messages that could not be delivered or processed. Inserting past
//! capacity evicts the oldest entry, so the queue never exceeds its bound.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use nodeflow_types::definition::NodeId;
use nodeflow_types::message::Message;
use serde::{Deserialize, Serialize};

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Evicted from a full node queue.
    Evicted,
    /// Cleared by a cancel cascade or workflow cancellation.
    Cancelled,
    /// A failure no connection handled.
    Unhandled,
    /// Waiting on an All-join that can no longer complete.
    JoinIncomplete,
    /// Rejected by the target queue.
    Undeliverable,
    /// Dropped by join gating: the epoch already fired or the source
    /// already reported for it.
    Duplicate,
}

/// A message that left the normal delivery path.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message: Arc<Message>,
    /// Node the message was queued for, when known.
    pub target_node_id: Option<NodeId>,
    pub reason: DeadLetterReason,
    pub dead_lettered_at: DateTime<Utc>,
}

/// FIFO-evicting store of dead letters.
pub struct DeadLetterQueue {
    capacity: usize,
    entries: Mutex<VecDeque<DeadLetter>>,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<DeadLetter>> {
        self.entries.lock().expect("dead-letter queue lock poisoned")
    }

    /// Record a dead letter, evicting the oldest entry when full.
    pub fn push(
        &self,
        message: Arc<Message>,
        target_node_id: Option<NodeId>,
        reason: DeadLetterReason,
    ) {
        tracing::debug!(
            message_id = %message.id,
            source = %message.node_id,
            target = target_node_id.as_deref().unwrap_or("-"),
            ?reason,
            "message dead-lettered"
        );
        let mut entries = self.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(DeadLetter {
            message,
            target_node_id,
            reason,
            dead_lettered_at: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of all entries, oldest first.
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.lock().iter().cloned().collect()
    }

    /// Remove and return all entries.
    pub fn drain(&self) -> Vec<DeadLetter> {
        self.lock().drain(..).collect()
    }
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_ten_keeps_ten_most_recent() {
        let dlq = DeadLetterQueue::new(10);
        let messages: Vec<Arc<Message>> = (0..11)
            .map(|i| Arc::new(Message::fail("worker", 0, format!("failure {i}"), None)))
            .collect();
        for m in &messages {
            dlq.push(m.clone(), Some("sink".into()), DeadLetterReason::Unhandled);
        }

        assert_eq!(dlq.len(), 10);
        let kept: Vec<_> = dlq.entries().iter().map(|d| d.message.id).collect();
        let expected: Vec<_> = messages[1..].iter().map(|m| m.id).collect();
        assert_eq!(kept, expected);
    }

    #[test]
    fn drain_empties_queue() {
        let dlq = DeadLetterQueue::new(4);
        dlq.push(
            Arc::new(Message::cancel("a", 0, false)),
            None,
            DeadLetterReason::Cancelled,
        );
        assert!(!dlq.is_empty());
        let drained = dlq.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].reason, DeadLetterReason::Cancelled);
        assert!(dlq.is_empty());
    }
}
