//! Message router and join tracking.
//!
//! The router maps a produced message onto the outbound connections of its
//! source node that match the message kind (and output port), then enqueues
//! one shared copy per target. Join semantics are evaluated per
//! (target, epoch):
//!
//! - **Any**: the first delivery of an epoch is admitted; later ones for the
//!   same epoch are dropped, so a diamond never runs its sink twice.
//! - **All**: the set of reporting sources is tracked; once it covers every
//!   inbound source the epoch is marked ready for dispatch. Set insertion is
//!   commutative, so arrival order never matters.
//!
//! Progress messages bypass join gating in both modes: they never fill a
//! source's slot and each one is delivered as its own activation. Arrivals
//! that gating drops are dead-lettered as `Duplicate`.
//!
//! Delivery happens under the join lock so an epoch is never visible as
//! ready before its last message sits in the target queue.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use nodeflow_types::definition::{JoinType, NodeConnection, NodeId, WorkflowDefinition};
use nodeflow_types::message::{Message, MessageKind, MessagePayload};

use super::dag::WorkflowGraph;
use super::dead_letter::{DeadLetterQueue, DeadLetterReason};
use super::queue::NodeQueue;

/// Queues of one workflow instance, keyed by node id.
pub type QueueSet = HashMap<NodeId, NodeQueue>;

/// What happened to a routed message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Targets whose queue received the message.
    pub delivered: Vec<NodeId>,
    /// Targets that dropped it (join already satisfied or duplicate source).
    /// Each drop is also recorded in the dead-letter queue.
    pub dropped: Vec<NodeId>,
}

impl RouteOutcome {
    /// True if at least one connection matched the message.
    pub fn matched(&self) -> bool {
        !self.delivered.is_empty() || !self.dropped.is_empty()
    }
}

/// Whether messages of `kind` take part in join bookkeeping.
fn gates_join(kind: MessageKind) -> bool {
    !matches!(kind, MessageKind::Progress | MessageKind::Cancel)
}

// ---------------------------------------------------------------------------
// JoinTracker
// ---------------------------------------------------------------------------

/// Per-instance join bookkeeping.
#[derive(Debug, Default)]
struct JoinTracker {
    /// (target, epoch) pairs already admitted (Any) or completed (All).
    fired: HashSet<(NodeId, u64)>,
    /// Sources reported so far for incomplete All joins.
    arrivals: HashMap<(NodeId, u64), HashSet<NodeId>>,
    /// Completed All-join epochs awaiting dispatch, oldest first.
    ready: HashMap<NodeId, VecDeque<u64>>,
}

// ---------------------------------------------------------------------------
// MessageRouter
// ---------------------------------------------------------------------------

/// Connection-based fan-out/fan-in for one workflow instance.
pub struct MessageRouter {
    outbound: HashMap<NodeId, Vec<NodeConnection>>,
    required_sources: HashMap<NodeId, BTreeSet<NodeId>>,
    join_types: HashMap<NodeId, JoinType>,
    graph: WorkflowGraph,
    joins: Mutex<JoinTracker>,
}

impl MessageRouter {
    pub fn new(definition: &WorkflowDefinition, graph: WorkflowGraph) -> Self {
        let mut outbound: HashMap<NodeId, Vec<NodeConnection>> = HashMap::new();
        let mut required_sources: HashMap<NodeId, BTreeSet<NodeId>> = HashMap::new();
        for conn in &definition.connections {
            outbound
                .entry(conn.source_node_id.clone())
                .or_default()
                .push(conn.clone());
            if gates_join(conn.trigger) {
                required_sources
                    .entry(conn.target_node_id.clone())
                    .or_default()
                    .insert(conn.source_node_id.clone());
            }
        }
        let join_types = definition
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.join_type))
            .collect();

        Self {
            outbound,
            required_sources,
            join_types,
            graph,
            joins: Mutex::new(JoinTracker::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JoinTracker> {
        self.joins.lock().expect("join tracker lock poisoned")
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    /// Whether `node_id` waits on an All-join barrier.
    pub fn requires_all(&self, node_id: &str) -> bool {
        self.join_types.get(node_id) == Some(&JoinType::All)
            && self
                .required_sources
                .get(node_id)
                .is_some_and(|s| !s.is_empty())
    }

    /// Outbound connections of `node_id` matching `kind`.
    pub fn has_route(&self, node_id: &str, kind: MessageKind) -> bool {
        self.outbound
            .get(node_id)
            .is_some_and(|conns| conns.iter().any(|c| c.trigger == kind))
    }

    /// Deliver `message` to every matching target of its producer.
    ///
    /// `Cancel` messages are not routed over connections; they trigger a
    /// cancel cascade through every reachable node instead.
    pub fn route(&self, message: Message, queues: &QueueSet, dlq: &DeadLetterQueue) -> RouteOutcome {
        if let MessagePayload::Cancel {
            cascade_from_failure,
        } = message.payload
        {
            let reached =
                self.cancel_cascade(&message.node_id, message.epoch, cascade_from_failure, queues, dlq);
            return RouteOutcome {
                delivered: reached,
                dropped: Vec::new(),
            };
        }

        let kind = message.kind();
        let port = match &message.payload {
            MessagePayload::Complete { port, .. } => port.clone(),
            _ => None,
        };
        let Some(connections) = self.outbound.get(&message.node_id) else {
            return RouteOutcome::default();
        };

        let shared = Arc::new(message);
        let mut outcome = RouteOutcome::default();
        for conn in connections {
            if conn.trigger != kind {
                continue;
            }
            if let Some(wanted) = &conn.source_port {
                if port.as_deref() != Some(wanted.as_str()) {
                    continue;
                }
            }
            if self.deliver(&conn.target_node_id, Arc::clone(&shared), queues, dlq) {
                outcome.delivered.push(conn.target_node_id.clone());
            } else {
                outcome.dropped.push(conn.target_node_id.clone());
            }
        }

        tracing::debug!(
            source = %shared.node_id,
            epoch = shared.epoch,
            kind = ?kind,
            delivered = outcome.delivered.len(),
            dropped = outcome.dropped.len(),
            "message routed"
        );
        outcome
    }

    /// Enqueue `message` for `target`, applying the target's join semantics.
    pub fn deliver(
        &self,
        target: &str,
        message: Arc<Message>,
        queues: &QueueSet,
        dlq: &DeadLetterQueue,
    ) -> bool {
        let Some(queue) = queues.get(target) else {
            dlq.push(message, Some(target.to_string()), DeadLetterReason::Undeliverable);
            return false;
        };

        let mut joins = self.lock();
        let key = (target.to_string(), message.epoch);
        let kind = message.kind();
        let mut completes_join = false;

        if gates_join(kind) && !message.is_seed() {
            if self.requires_all(target) {
                if joins.fired.contains(&key) {
                    tracing::debug!(target, epoch = message.epoch, "join already complete, dropping late arrival");
                    dlq.push(message, Some(target.to_string()), DeadLetterReason::Duplicate);
                    return false;
                }
                let arrivals = joins.arrivals.entry(key.clone()).or_default();
                if !arrivals.insert(message.node_id.clone()) {
                    tracing::debug!(
                        target,
                        source = %message.node_id,
                        epoch = message.epoch,
                        "duplicate join arrival dropped"
                    );
                    dlq.push(message, Some(target.to_string()), DeadLetterReason::Duplicate);
                    return false;
                }
                let required = &self.required_sources[target];
                completes_join = required.iter().all(|s| arrivals.contains(s));
            } else if !joins.fired.insert(key.clone()) {
                tracing::debug!(target, epoch = message.epoch, "epoch already triggered, dropping");
                dlq.push(message, Some(target.to_string()), DeadLetterReason::Duplicate);
                return false;
            }
        }

        match queue.enqueue(Arc::clone(&message)) {
            Ok(evicted) => {
                if let Some(evicted) = evicted {
                    dlq.push(evicted, Some(target.to_string()), DeadLetterReason::Evicted);
                }
            }
            Err(error) => {
                tracing::warn!(target, %error, "delivery rejected by queue");
                if let Some(arrivals) = joins.arrivals.get_mut(&key) {
                    arrivals.remove(&message.node_id);
                }
                dlq.push(message, Some(target.to_string()), DeadLetterReason::Undeliverable);
                return false;
            }
        }

        if completes_join {
            joins.arrivals.remove(&key);
            joins.fired.insert(key.clone());
            joins.ready.entry(key.0).or_default().push_back(key.1);
            tracing::debug!(target, epoch = message.epoch, "join complete");
        }
        true
    }

    /// Pop the oldest completed All-join epoch for `target`.
    pub fn take_ready_epoch(&self, target: &str) -> Option<u64> {
        self.lock().ready.get_mut(target)?.pop_front()
    }

    pub fn has_ready_epoch(&self, target: &str) -> bool {
        self.lock().ready.get(target).is_some_and(|q| !q.is_empty())
    }

    /// Return a previously taken epoch to the front of the ready list.
    pub fn restore_ready_epoch(&self, target: &str, epoch: u64) {
        self.lock()
            .ready
            .entry(target.to_string())
            .or_default()
            .push_front(epoch);
    }

    /// Clear queued work downstream of `from` and send each node a Cancel.
    ///
    /// Ready messages of every reachable node move to the dead-letter queue,
    /// partial join state for those nodes is discarded, and one Cancel
    /// message is enqueued per node. Returns the nodes reached.
    pub fn cancel_cascade(
        &self,
        from: &str,
        epoch: u64,
        cascade_from_failure: bool,
        queues: &QueueSet,
        dlq: &DeadLetterQueue,
    ) -> Vec<NodeId> {
        let mut reached: Vec<NodeId> = self.graph.descendants(from).into_iter().collect();
        reached.sort();

        let mut joins = self.lock();
        for target in &reached {
            let Some(queue) = queues.get(target) else {
                continue;
            };
            for cleared in queue.drain_ready(|m| m.kind() != MessageKind::Cancel) {
                dlq.push(cleared, Some(target.clone()), DeadLetterReason::Cancelled);
            }
            joins.arrivals.retain(|(node, _), _| node != target);
            joins.ready.remove(target);

            let cancel = Arc::new(Message::cancel(from, epoch, cascade_from_failure));
            match queue.enqueue(Arc::clone(&cancel)) {
                Ok(Some(evicted)) => {
                    dlq.push(evicted, Some(target.clone()), DeadLetterReason::Evicted)
                }
                Ok(None) => {}
                Err(_) => dlq.push(cancel, Some(target.clone()), DeadLetterReason::Undeliverable),
            }
        }

        tracing::debug!(from, cascade_from_failure, reached = reached.len(), "cancel cascaded");
        reached
    }

    /// Rebuild join bookkeeping from queue contents after a restore.
    pub fn rebuild_joins(&self, queues: &QueueSet) {
        let mut joins = self.lock();
        *joins = JoinTracker::default();

        for (target, queue) in queues {
            let mut by_epoch: HashMap<u64, HashSet<NodeId>> = HashMap::new();
            for slot in queue.get_all() {
                let m = &slot.message;
                if !gates_join(m.kind()) || m.is_seed() {
                    continue;
                }
                by_epoch.entry(m.epoch).or_default().insert(m.node_id.clone());
            }

            if self.requires_all(target) {
                let required = &self.required_sources[target];
                let mut epochs: Vec<u64> = by_epoch.keys().copied().collect();
                epochs.sort_unstable();
                for epoch in epochs {
                    let sources = by_epoch.remove(&epoch).unwrap_or_default();
                    let key = (target.clone(), epoch);
                    if required.iter().all(|s| sources.contains(s)) {
                        joins.fired.insert(key);
                        joins.ready.entry(target.clone()).or_default().push_back(epoch);
                    } else {
                        joins.arrivals.insert(key, sources);
                    }
                }
            } else {
                for epoch in by_epoch.into_keys() {
                    joins.fired.insert((target.clone(), epoch));
                }
            }
        }
    }

    /// Targets with incomplete All-join arrivals.
    pub fn pending_join_targets(&self) -> Vec<(NodeId, u64)> {
        let mut pending: Vec<(NodeId, u64)> = self.lock().arrivals.keys().cloned().collect();
        pending.sort();
        pending
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("sources", &self.outbound.len())
            .finish()
    }
}
