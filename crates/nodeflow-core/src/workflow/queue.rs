//! Per-node lease-based message queue.
//!
//! Each node owns exactly one `NodeQueue`. Slots move through
//! Ready -> InFlight (leased) -> Completed (removed), or are evicted as
//! Superseded when the queue overflows. Every transition happens under the
//! queue's mutex so a message can never be checked out or acknowledged twice.
//!
//! Leases give at-least-once delivery: an InFlight slot whose lease expires
//! without acknowledgement is returned to Ready by `reclaim_expired`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nodeflow_types::definition::NodeId;
use nodeflow_types::message::{Message, MessageKind};
use uuid::Uuid;

/// Lifecycle status of a queue slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Ready,
    InFlight,
    /// Acknowledged; the slot is removed.
    Completed,
    /// Evicted to make room; the slot is removed.
    Superseded,
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    pub message: Arc<Message>,
    pub status: SlotStatus,
    pub owner: Option<String>,
    pub lease_expires_at: Option<Instant>,
}

/// Errors returned by [`NodeQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("message {0} is already queued")]
    Duplicate(Uuid),
}

struct Slot {
    message: Arc<Message>,
    status: SlotStatus,
    owner: Option<String>,
    lease_expires_at: Option<Instant>,
    enqueued_at: Instant,
}

impl Slot {
    fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            message: Arc::clone(&self.message),
            status: self.status,
            owner: self.owner.clone(),
            lease_expires_at: self.lease_expires_at,
        }
    }
}

// ---------------------------------------------------------------------------
// NodeQueue
// ---------------------------------------------------------------------------

/// Bounded FIFO of messages awaiting one node.
pub struct NodeQueue {
    node_id: NodeId,
    capacity: usize,
    slots: Mutex<VecDeque<Slot>>,
}

impl NodeQueue {
    pub fn new(node_id: impl Into<NodeId>, capacity: usize) -> Self {
        Self {
            node_id: node_id.into(),
            capacity: capacity.max(1),
            slots: Mutex::new(VecDeque::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Slot>> {
        self.slots.lock().expect("node queue lock poisoned")
    }

    /// Append a Ready slot.
    ///
    /// At capacity the oldest Ready slot is evicted and returned so the
    /// caller can dead-letter it. If every slot is leased nothing is evicted
    /// and the queue temporarily exceeds its capacity.
    pub fn enqueue(&self, message: Arc<Message>) -> Result<Option<Arc<Message>>, QueueError> {
        if message.id.is_nil() {
            return Err(QueueError::InvalidMessage("message id is nil".into()));
        }
        if message.node_id.is_empty() {
            return Err(QueueError::InvalidMessage(
                "message has no producing node".into(),
            ));
        }

        let mut slots = self.lock();
        if slots.iter().any(|s| s.message.id == message.id) {
            return Err(QueueError::Duplicate(message.id));
        }

        let mut evicted = None;
        if slots.len() >= self.capacity {
            match slots.iter().position(|s| s.status == SlotStatus::Ready) {
                Some(pos) => {
                    if let Some(mut slot) = slots.remove(pos) {
                        slot.status = SlotStatus::Superseded;
                        tracing::warn!(
                            node_id = %self.node_id,
                            message_id = %slot.message.id,
                            capacity = self.capacity,
                            "queue full, evicting oldest ready message"
                        );
                        evicted = Some(slot.message);
                    }
                }
                None => tracing::warn!(
                    node_id = %self.node_id,
                    capacity = self.capacity,
                    "queue full of in-flight messages, admitting over capacity"
                ),
            }
        }

        slots.push_back(Slot {
            message,
            status: SlotStatus::Ready,
            owner: None,
            lease_expires_at: None,
            enqueued_at: Instant::now(),
        });
        Ok(evicted)
    }

    /// Lease the oldest Ready message of `kind` (any kind when `None`).
    pub fn checkout(
        &self,
        kind: Option<MessageKind>,
        handler_id: &str,
        lease: Duration,
    ) -> Option<Arc<Message>> {
        self.checkout_where(handler_id, lease, |m| kind.is_none_or(|k| m.kind() == k))
    }

    /// Lease the oldest Ready message matching `predicate`.
    pub fn checkout_where<P>(
        &self,
        handler_id: &str,
        lease: Duration,
        predicate: P,
    ) -> Option<Arc<Message>>
    where
        P: Fn(&Message) -> bool,
    {
        let mut slots = self.lock();
        let slot = slots
            .iter_mut()
            .find(|s| s.status == SlotStatus::Ready && predicate(&s.message))?;
        slot.status = SlotStatus::InFlight;
        slot.owner = Some(handler_id.to_string());
        slot.lease_expires_at = Some(Instant::now() + lease);
        Some(Arc::clone(&slot.message))
    }

    /// Complete an InFlight message and remove it.
    ///
    /// Returns `false` for unknown ids and for slots that are not InFlight,
    /// which includes a second acknowledgement of the same id.
    pub fn acknowledge(&self, message_id: Uuid) -> bool {
        let mut slots = self.lock();
        let Some(pos) = slots
            .iter()
            .position(|s| s.message.id == message_id && s.status == SlotStatus::InFlight)
        else {
            return false;
        };
        slots.remove(pos);
        true
    }

    /// Return an InFlight message to Ready, keeping its queue position.
    pub fn requeue(&self, message_id: Uuid) -> bool {
        let mut slots = self.lock();
        match slots
            .iter_mut()
            .find(|s| s.message.id == message_id && s.status == SlotStatus::InFlight)
        {
            Some(slot) => {
                slot.status = SlotStatus::Ready;
                slot.owner = None;
                slot.lease_expires_at = None;
                true
            }
            None => false,
        }
    }

    /// Requeue every InFlight slot whose lease expired before `now`.
    pub fn reclaim_expired(&self, now: Instant) -> Vec<Uuid> {
        let mut slots = self.lock();
        let mut reclaimed = Vec::new();
        for slot in slots.iter_mut() {
            let expired = slot.status == SlotStatus::InFlight
                && slot.lease_expires_at.is_some_and(|at| at <= now);
            if expired {
                tracing::warn!(
                    node_id = %self.node_id,
                    message_id = %slot.message.id,
                    owner = slot.owner.as_deref().unwrap_or("unknown"),
                    "lease expired, message requeued"
                );
                slot.status = SlotStatus::Ready;
                slot.owner = None;
                slot.lease_expires_at = None;
                reclaimed.push(slot.message.id);
            }
        }
        reclaimed
    }

    /// Remove every Ready message matching `predicate`, oldest first.
    pub fn drain_ready<P>(&self, predicate: P) -> Vec<Arc<Message>>
    where
        P: Fn(&Message) -> bool,
    {
        let mut slots = self.lock();
        let mut drained = Vec::new();
        slots.retain(|s| {
            if s.status == SlotStatus::Ready && predicate(&s.message) {
                drained.push(Arc::clone(&s.message));
                false
            } else {
                true
            }
        });
        drained
    }

    /// Whether a Ready message matching `predicate` exists.
    pub fn has_ready<P>(&self, predicate: P) -> bool
    where
        P: Fn(&Message) -> bool,
    {
        self.lock()
            .iter()
            .any(|s| s.status == SlotStatus::Ready && predicate(&s.message))
    }

    /// Enqueue time of the oldest Ready message matching `predicate`.
    pub fn oldest_ready<P>(&self, predicate: P) -> Option<Instant>
    where
        P: Fn(&Message) -> bool,
    {
        self.lock()
            .iter()
            .find(|s| s.status == SlotStatus::Ready && predicate(&s.message))
            .map(|s| s.enqueued_at)
    }

    /// Number of slots (Ready and InFlight).
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn count_with_status(&self, status: SlotStatus) -> usize {
        self.lock().iter().filter(|s| s.status == status).count()
    }

    /// Snapshot of every slot in queue order.
    pub fn get_all(&self) -> Vec<SlotSnapshot> {
        self.lock().iter().map(Slot::snapshot).collect()
    }
}

impl std::fmt::Debug for NodeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeQueue")
            .field("node_id", &self.node_id)
            .field("capacity", &self.capacity)
            .field("len", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(30);

    fn msg(n: i64) -> Arc<Message> {
        Arc::new(Message::complete("upstream", 0, json!(n), None))
    }

    #[test]
    fn checkout_on_empty_queue_returns_none() {
        let queue = NodeQueue::new("a", 8);
        assert!(queue.checkout(None, "worker", LEASE).is_none());
        assert!(
            queue
                .checkout(Some(MessageKind::Complete), "worker", LEASE)
                .is_none()
        );
    }

    #[test]
    fn second_acknowledge_returns_false() {
        let queue = NodeQueue::new("a", 8);
        let m = msg(1);
        queue.enqueue(m.clone()).unwrap();

        let leased = queue.checkout(None, "worker", LEASE).unwrap();
        assert_eq!(leased.id, m.id);
        assert!(queue.acknowledge(m.id));
        assert!(!queue.acknowledge(m.id));
        assert_eq!(queue.count(), 0);
    }

    #[test]
    fn acknowledge_requires_in_flight() {
        let queue = NodeQueue::new("a", 8);
        let m = msg(1);
        queue.enqueue(m.clone()).unwrap();
        assert!(!queue.acknowledge(m.id));
        assert!(!queue.acknowledge(Uuid::now_v7()));
        assert_eq!(queue.count(), 1);
    }

    #[test]
    fn checkout_is_fifo_and_filters_by_kind() {
        let queue = NodeQueue::new("a", 8);
        let first = msg(1);
        let cancel = Arc::new(Message::cancel("upstream", 0, false));
        let second = msg(2);
        queue.enqueue(first.clone()).unwrap();
        queue.enqueue(cancel.clone()).unwrap();
        queue.enqueue(second.clone()).unwrap();

        let c = queue
            .checkout(Some(MessageKind::Cancel), "w", LEASE)
            .unwrap();
        assert_eq!(c.id, cancel.id);
        assert_eq!(
            queue
                .checkout(Some(MessageKind::Complete), "w", LEASE)
                .unwrap()
                .id,
            first.id
        );
        assert_eq!(queue.checkout(None, "w", LEASE).unwrap().id, second.id);
        assert!(queue.checkout(None, "w", LEASE).is_none());
    }

    #[test]
    fn overflow_evicts_oldest_ready() {
        let queue = NodeQueue::new("a", 2);
        let a = msg(1);
        let b = msg(2);
        let c = msg(3);
        queue.enqueue(a.clone()).unwrap();
        queue.enqueue(b.clone()).unwrap();

        let evicted = queue.enqueue(c.clone()).unwrap();
        assert_eq!(evicted.map(|m| m.id), Some(a.id));
        let ids: Vec<Uuid> = queue.get_all().iter().map(|s| s.message.id).collect();
        assert_eq!(ids, vec![b.id, c.id]);
    }

    #[test]
    fn overflow_never_evicts_leased_messages() {
        let queue = NodeQueue::new("a", 1);
        let a = msg(1);
        queue.enqueue(a.clone()).unwrap();
        queue.checkout(None, "w", LEASE).unwrap();

        let evicted = queue.enqueue(msg(2)).unwrap();
        assert!(evicted.is_none());
        assert_eq!(queue.count(), 2);
        assert_eq!(queue.count_with_status(SlotStatus::InFlight), 1);
    }

    #[test]
    fn duplicate_and_invalid_messages_are_rejected() {
        let queue = NodeQueue::new("a", 4);
        let m = msg(1);
        queue.enqueue(m.clone()).unwrap();
        assert_eq!(queue.enqueue(m.clone()), Err(QueueError::Duplicate(m.id)));

        let mut nil = Message::seed(json!(null));
        nil.id = Uuid::nil();
        assert!(matches!(
            queue.enqueue(Arc::new(nil)),
            Err(QueueError::InvalidMessage(_))
        ));

        let anonymous = Message::complete("", 0, json!(null), None);
        assert!(queue.enqueue(Arc::new(anonymous)).is_err());
    }

    #[test]
    fn requeue_returns_message_to_ready_in_place() {
        let queue = NodeQueue::new("a", 4);
        let a = msg(1);
        let b = msg(2);
        queue.enqueue(a.clone()).unwrap();
        queue.enqueue(b.clone()).unwrap();

        queue.checkout(None, "w", LEASE).unwrap();
        assert!(queue.requeue(a.id));
        assert!(!queue.requeue(a.id));
        assert!(!queue.requeue(Uuid::now_v7()));
        assert_eq!(queue.checkout(None, "w", LEASE).unwrap().id, a.id);
    }

    #[test]
    fn expired_leases_are_reclaimed() {
        let queue = NodeQueue::new("a", 4);
        let a = msg(1);
        let b = msg(2);
        queue.enqueue(a.clone()).unwrap();
        queue.enqueue(b.clone()).unwrap();
        queue.checkout(None, "short", Duration::ZERO).unwrap();
        queue.checkout(None, "long", LEASE).unwrap();

        let reclaimed = queue.reclaim_expired(Instant::now());
        assert_eq!(reclaimed, vec![a.id]);
        let snapshot = queue.get_all();
        assert_eq!(snapshot[0].status, SlotStatus::Ready);
        assert!(snapshot[0].owner.is_none());
        assert_eq!(snapshot[1].status, SlotStatus::InFlight);
        assert_eq!(snapshot[1].owner.as_deref(), Some("long"));
    }

    #[test]
    fn drain_ready_leaves_in_flight_alone() {
        let queue = NodeQueue::new("a", 4);
        let a = msg(1);
        queue.enqueue(a.clone()).unwrap();
        queue.enqueue(msg(2)).unwrap();
        queue.enqueue(msg(3)).unwrap();
        queue.checkout(None, "w", LEASE).unwrap();

        let drained = queue.drain_ready(|_| true);
        assert_eq!(drained.len(), 2);
        assert_eq!(queue.count(), 1);
        assert!(queue.acknowledge(a.id));
        assert!(!queue.has_ready(|_| true));
        assert!(queue.oldest_ready(|_| true).is_none());
    }
}
