//! Per-instance workflow execution context.
//!
//! `WorkflowExecutionContext` owns everything one workflow instance needs at
//! runtime: status, shared variables, one queue per node, the router with its
//! join state, the dead-letter queue, per-node state and the attempt history.
//! Nodes receive it by shared reference; the engine drives it.
//!
//! All state is scoped to the instance. Concurrent node executions mutate
//! `variables` with last-write-wins semantics and no cross-key transactions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nodeflow_types::checkpoint::{PendingMessage, WorkflowCheckpoint};
use nodeflow_types::compensation::CompensationRecord;
use nodeflow_types::config::EngineConfig;
use nodeflow_types::definition::{NodeId, WorkflowDefinition};
use nodeflow_types::event::WorkflowEvent;
use nodeflow_types::instance::{CompletedActivation, NodeErrorInfo, NodeInstance, NodeInstanceState};
use nodeflow_types::message::{Message, MessageKind, MessagePayload, WORKFLOW_START};
use nodeflow_types::status::{NodeStatus, WorkflowStatus};
use serde_json::Value;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::node::SignalSink;

use super::dag::{WorkflowGraph, entry_points};
use super::dead_letter::{DeadLetterQueue, DeadLetterReason};
use super::queue::{NodeQueue, SlotStatus};
use super::router::{MessageRouter, QueueSet, RouteOutcome};

/// Handler id used when the dispatcher itself checks out messages.
const DISPATCHER: &str = "dispatcher";

/// Why an instance failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowFailure {
    /// `None` for workflow-level failures such as a workflow timeout.
    pub failed_node_id: Option<NodeId>,
    pub error: String,
}

// ---------------------------------------------------------------------------
// WorkflowExecutionContext
// ---------------------------------------------------------------------------

/// Runtime state of one workflow instance.
pub struct WorkflowExecutionContext {
    instance_id: Uuid,
    definition: Arc<WorkflowDefinition>,
    status: watch::Sender<WorkflowStatus>,
    variables: DashMap<String, Value>,
    queues: QueueSet,
    router: MessageRouter,
    dead_letters: DeadLetterQueue,
    node_states: DashMap<NodeId, NodeInstanceState>,
    history: Mutex<Vec<NodeInstance>>,
    completion_order: Mutex<Vec<CompletedActivation>>,
    compensations: Mutex<Vec<CompensationRecord>>,
    failure: Mutex<Option<WorkflowFailure>>,
    created_at: DateTime<Utc>,
    completed_at: Mutex<Option<DateTime<Utc>>>,
    started: Instant,
    /// Run time accumulated before the last restore.
    prior_run: Duration,
    epochs: AtomicU64,
    execution_token: CancellationToken,
    wake: Notify,
    events: EventBus,
    lease_duration: Duration,
    default_node_timeout: Option<Duration>,
}

impl WorkflowExecutionContext {
    /// Fresh context for a new instance. Every node starts Pending with an
    /// empty queue.
    pub fn new(
        instance_id: Uuid,
        definition: Arc<WorkflowDefinition>,
        graph: WorkflowGraph,
        config: &EngineConfig,
        events: EventBus,
    ) -> Self {
        let queues = definition
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeQueue::new(n.id.clone(), config.queue_capacity)))
            .collect();
        let node_states = definition
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeInstanceState::pending(n.id.clone())))
            .collect();
        let router = MessageRouter::new(&definition, graph);
        let (status, _) = watch::channel(WorkflowStatus::Pending);

        Self {
            instance_id,
            definition,
            status,
            variables: DashMap::new(),
            queues,
            router,
            dead_letters: DeadLetterQueue::new(config.dead_letter_capacity),
            node_states,
            history: Mutex::new(Vec::new()),
            completion_order: Mutex::new(Vec::new()),
            compensations: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            created_at: Utc::now(),
            completed_at: Mutex::new(None),
            started: Instant::now(),
            prior_run: Duration::ZERO,
            epochs: AtomicU64::new(0),
            execution_token: CancellationToken::new(),
            wake: Notify::new(),
            events,
            lease_duration: config.lease_duration(),
            default_node_timeout: config.default_node_timeout(),
        }
    }

    /// Rebuild a context from a checkpoint.
    ///
    /// Every pending message returns as Ready, including ones that were
    /// InFlight when the snapshot was taken, and join state is recomputed
    /// from the restored queues.
    pub fn from_checkpoint(
        checkpoint: WorkflowCheckpoint,
        graph: WorkflowGraph,
        config: &EngineConfig,
        events: EventBus,
    ) -> Self {
        let WorkflowCheckpoint {
            instance_id,
            definition,
            status,
            created_at,
            variables,
            node_states,
            node_instances,
            pending_messages,
            completion_order,
            compensations,
            epoch_counter,
            run_duration_ms,
            error,
            failed_node_id,
            ..
        } = checkpoint;

        let mut ctx = Self::new(instance_id, Arc::new(definition), graph, config, events);
        ctx.created_at = created_at;
        ctx.prior_run = Duration::from_millis(run_duration_ms);
        ctx.status.send_replace(status);
        ctx.epochs.store(epoch_counter, Ordering::SeqCst);
        for (key, value) in variables {
            ctx.variables.insert(key, value);
        }
        for (node_id, state) in node_states {
            ctx.node_states.insert(node_id, state);
        }
        *ctx.history.get_mut().expect("history lock poisoned") = node_instances;
        *ctx.completion_order.get_mut().expect("completion lock poisoned") = completion_order;
        *ctx.compensations.get_mut().expect("compensation lock poisoned") = compensations;
        if let Some(error) = error {
            *ctx.failure.get_mut().expect("failure lock poisoned") = Some(WorkflowFailure {
                failed_node_id,
                error,
            });
        }

        let mut restored = 0usize;
        for (node_id, pending) in pending_messages {
            let Some(queue) = ctx.queues.get(&node_id) else {
                tracing::warn!(%instance_id, node_id = %node_id, "checkpoint holds messages for unknown node");
                continue;
            };
            for PendingMessage { message, .. } in pending {
                match queue.enqueue(Arc::new(message)) {
                    Ok(Some(evicted)) => {
                        ctx.dead_letters
                            .push(evicted, Some(node_id.clone()), DeadLetterReason::Evicted)
                    }
                    Ok(None) => restored += 1,
                    Err(error) => tracing::warn!(%instance_id, node_id = %node_id, %error, "skipping restored message"),
                }
            }
        }
        ctx.router.rebuild_joins(&ctx.queues);
        tracing::debug!(%instance_id, restored, "context restored from checkpoint");
        ctx
    }

    // -- identity and status ------------------------------------------------

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn status(&self) -> WorkflowStatus {
        *self.status.borrow()
    }

    pub fn set_status(&self, status: WorkflowStatus) {
        self.status.send_replace(status);
        if status.is_terminal() {
            let mut completed = self.completed_at.lock().expect("timestamp lock poisoned");
            completed.get_or_insert_with(Utc::now);
        }
    }

    /// Receiver observing status changes.
    pub fn watch_status(&self) -> watch::Receiver<WorkflowStatus> {
        self.status.subscribe()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        *self.completed_at.lock().expect("timestamp lock poisoned")
    }

    /// Run time of the instance, accumulated across pause and resume.
    pub fn elapsed(&self) -> Duration {
        self.prior_run + self.started.elapsed()
    }

    /// Token observed by every node execution of this instance.
    pub fn execution_token(&self) -> &CancellationToken {
        &self.execution_token
    }

    // -- variables ----------------------------------------------------------

    pub fn get_variable(&self, key: &str) -> Option<Value> {
        self.variables.get(key).map(|v| v.value().clone())
    }

    /// Set a shared variable. Last write wins.
    pub fn set_variable(&self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    pub fn remove_variable(&self, key: &str) -> Option<Value> {
        self.variables.remove(key).map(|(_, v)| v)
    }

    /// Point-in-time copy of all variables.
    pub fn variables(&self) -> HashMap<String, Value> {
        self.variables
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    // -- queues and routing -------------------------------------------------

    pub fn queue(&self, node_id: &str) -> Option<&NodeQueue> {
        self.queues.get(node_id)
    }

    pub(crate) fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    pub(crate) fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub(crate) fn default_node_timeout(&self) -> Option<Duration> {
        self.default_node_timeout
    }

    /// Route a produced message and wake the dispatcher.
    pub(crate) fn route(&self, message: Message) -> RouteOutcome {
        let outcome = self.router.route(message, &self.queues, &self.dead_letters);
        self.wake.notify_one();
        outcome
    }

    /// Place the start message into every entry point's queue.
    pub(crate) fn seed(&self, input: &Value) -> Vec<NodeId> {
        let entries = entry_points(&self.definition);
        for entry in &entries {
            let seed = Arc::new(Message::seed(input.clone()));
            if let Some(queue) = self.queues.get(entry) {
                if let Err(error) = queue.enqueue(Arc::clone(&seed)) {
                    tracing::warn!(instance_id = %self.instance_id, node_id = %entry, %error, "seed rejected");
                    self.dead_letters
                        .push(seed, Some(entry.clone()), DeadLetterReason::Undeliverable);
                }
            }
        }
        self.wake.notify_one();
        entries
    }

    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await;
    }

    /// Open a fresh epoch for a `Next` message.
    pub(crate) fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Return expired leases to Ready across all queues.
    pub(crate) fn reclaim_expired(&self) -> usize {
        let now = Instant::now();
        let reclaimed: usize = self
            .queues
            .values()
            .map(|q| q.reclaim_expired(now).len())
            .sum();
        if reclaimed > 0 {
            self.wake.notify_one();
        }
        reclaimed
    }

    /// Clear queued work for the whole instance and send every node a Cancel.
    pub(crate) fn cancel_pending(&self, cascade_from_failure: bool) {
        for entry in entry_points(&self.definition) {
            let Some(queue) = self.queues.get(&entry) else {
                continue;
            };
            for cleared in queue.drain_ready(|m| m.kind() != MessageKind::Cancel) {
                self.dead_letters
                    .push(cleared, Some(entry.clone()), DeadLetterReason::Cancelled);
            }
            let cancel = Arc::new(Message::cancel(WORKFLOW_START, 0, cascade_from_failure));
            if queue.enqueue(Arc::clone(&cancel)).is_err() {
                self.dead_letters
                    .push(cancel, Some(entry.clone()), DeadLetterReason::Undeliverable);
            }
            self.router
                .cancel_cascade(&entry, 0, cascade_from_failure, &self.queues, &self.dead_letters);
        }
        self.wake.notify_one();
    }

    /// Consume every queued Cancel message, recording the affected nodes.
    ///
    /// Cancels never take a concurrency slot. A node that already completed
    /// or failed keeps its record. Returns the number of nodes recorded.
    pub(crate) fn process_cancel_messages(&self) -> usize {
        let mut recorded = 0;
        for (node_id, queue) in &self.queues {
            while let Some(message) =
                queue.checkout(Some(MessageKind::Cancel), DISPATCHER, self.lease_duration)
            {
                let cascade_from_failure = matches!(
                    message.payload,
                    MessagePayload::Cancel {
                        cascade_from_failure: true
                    }
                );
                if self.mark_cancelled(node_id, cascade_from_failure) {
                    recorded += 1;
                    self.publish(WorkflowEvent::NodeCancelled {
                        instance_id: self.instance_id,
                        node_id: node_id.clone(),
                        cascade_from_failure,
                    });
                }
                queue.acknowledge(message.id);
            }
        }
        recorded
    }

    /// Move every remaining Ready message to the dead-letter queue.
    pub(crate) fn dead_letter_remaining<F>(&self, reason_for: F) -> usize
    where
        F: Fn(&str) -> DeadLetterReason,
    {
        let mut moved = 0;
        for (node_id, queue) in &self.queues {
            for message in queue.drain_ready(|_| true) {
                self.dead_letters
                    .push(message, Some(node_id.clone()), reason_for(node_id));
                moved += 1;
            }
        }
        moved
    }

    // -- node state ---------------------------------------------------------

    pub fn node_state(&self, node_id: &str) -> Option<NodeInstanceState> {
        self.node_states.get(node_id).map(|s| s.value().clone())
    }

    pub fn node_states(&self) -> HashMap<NodeId, NodeInstanceState> {
        self.node_states
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Whether `node_id` already completed the activation for `epoch`.
    pub fn has_completed(&self, node_id: &str, epoch: u64) -> bool {
        self.node_states
            .get(node_id)
            .is_some_and(|s| s.has_completed_epoch(epoch))
    }

    pub(crate) fn mark_attempt(&self, node_id: &str) {
        if let Some(mut state) = self.node_states.get_mut(node_id) {
            state.status = NodeStatus::Running;
            state.attempts += 1;
            state.started_at.get_or_insert_with(Utc::now);
        }
    }

    pub(crate) fn mark_completed(&self, node_id: &str, epoch: u64, output: &Value) {
        self.record_completion(node_id, epoch, output, true);
    }

    /// Record an activation triggered only by Progress messages. The epoch
    /// stays open so the node's regular activation for it still runs.
    pub(crate) fn mark_progress_handled(&self, node_id: &str, epoch: u64, output: &Value) {
        self.record_completion(node_id, epoch, output, false);
    }

    fn record_completion(&self, node_id: &str, epoch: u64, output: &Value, seal_epoch: bool) {
        let now = Utc::now();
        if let Some(mut state) = self.node_states.get_mut(node_id) {
            state.status = NodeStatus::Completed;
            if seal_epoch && !state.completed_epochs.contains(&epoch) {
                state.completed_epochs.push(epoch);
            }
            state.last_output = Some(output.clone());
            state.completed_at = Some(now);
        }
        self.completion_order
            .lock()
            .expect("completion lock poisoned")
            .push(CompletedActivation {
                node_id: node_id.to_string(),
                epoch,
                completed_at: now,
                output: output.clone(),
            });
    }

    pub(crate) fn mark_failed(&self, node_id: &str, error: NodeErrorInfo) {
        if let Some(mut state) = self.node_states.get_mut(node_id) {
            state.status = NodeStatus::Failed;
            state.last_error = Some(error);
            state.completed_at = Some(Utc::now());
        }
    }

    /// Record a node as Cancelled (or Skipped). Returns false when the node
    /// already settled or was already cancelled.
    pub(crate) fn mark_cancelled(&self, node_id: &str, skipped: bool) -> bool {
        let Some(mut state) = self.node_states.get_mut(node_id) else {
            return false;
        };
        if state.status.is_settled()
            || matches!(state.status, NodeStatus::Cancelled | NodeStatus::Skipped)
        {
            return false;
        }
        state.status = if skipped {
            NodeStatus::Skipped
        } else {
            NodeStatus::Cancelled
        };
        state.completed_at = Some(Utc::now());
        true
    }

    pub(crate) fn record_instance(&self, instance: NodeInstance) {
        self.history
            .lock()
            .expect("history lock poisoned")
            .push(instance);
    }

    /// Every recorded attempt, oldest first.
    pub fn node_instances(&self) -> Vec<NodeInstance> {
        self.history.lock().expect("history lock poisoned").clone()
    }

    /// Completed activations in completion order.
    pub fn completion_order(&self) -> Vec<CompletedActivation> {
        self.completion_order
            .lock()
            .expect("completion lock poisoned")
            .clone()
    }

    /// Distinct completed nodes, in order of first completion.
    pub fn completed_nodes(&self) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.completion_order()
            .into_iter()
            .filter(|a| seen.insert(a.node_id.clone()))
            .map(|a| a.node_id)
            .collect()
    }

    pub(crate) fn record_compensations(&self, records: Vec<CompensationRecord>) {
        self.compensations
            .lock()
            .expect("compensation lock poisoned")
            .extend(records);
    }

    pub fn compensations(&self) -> Vec<CompensationRecord> {
        self.compensations
            .lock()
            .expect("compensation lock poisoned")
            .clone()
    }

    // -- failure ------------------------------------------------------------

    /// Record the instance failure. The first recorded failure is kept.
    pub(crate) fn record_failure(&self, failed_node_id: Option<NodeId>, error: impl Into<String>) -> bool {
        let mut failure = self.failure.lock().expect("failure lock poisoned");
        if failure.is_some() {
            return false;
        }
        *failure = Some(WorkflowFailure {
            failed_node_id,
            error: error.into(),
        });
        true
    }

    pub fn failure(&self) -> Option<WorkflowFailure> {
        self.failure.lock().expect("failure lock poisoned").clone()
    }

    pub fn error(&self) -> Option<String> {
        self.failure().map(|f| f.error)
    }

    // -- events -------------------------------------------------------------

    pub(crate) fn publish(&self, event: WorkflowEvent) {
        self.events.publish(event);
    }

    // -- checkpointing ------------------------------------------------------

    /// Serializable snapshot of the full instance state.
    pub fn snapshot(&self) -> WorkflowCheckpoint {
        let pending_messages = self
            .queues
            .iter()
            .filter_map(|(node_id, queue)| {
                let pending: Vec<PendingMessage> = queue
                    .get_all()
                    .into_iter()
                    .filter(|s| matches!(s.status, SlotStatus::Ready | SlotStatus::InFlight))
                    .map(|s| PendingMessage {
                        message: (*s.message).clone(),
                        in_flight: s.status == SlotStatus::InFlight,
                    })
                    .collect();
                (!pending.is_empty()).then(|| (node_id.clone(), pending))
            })
            .collect();
        let failure = self.failure();

        WorkflowCheckpoint {
            instance_id: self.instance_id,
            workflow_id: self.definition.id.clone(),
            definition: (*self.definition).clone(),
            status: self.status(),
            created_at: self.created_at,
            updated_at: Utc::now(),
            completed_at: self.completed_at(),
            variables: self.variables(),
            node_states: self.node_states(),
            node_instances: self.node_instances(),
            pending_messages,
            completion_order: self.completion_order(),
            compensations: self.compensations(),
            epoch_counter: self.epochs.load(Ordering::SeqCst),
            run_duration_ms: self.elapsed().as_millis() as u64,
            error: failure.as_ref().map(|f| f.error.clone()),
            failed_node_id: failure.and_then(|f| f.failed_node_id),
        }
    }
}

impl SignalSink for WorkflowExecutionContext {
    fn next(&self, node_id: &str, iteration: u64, output: Value) {
        let epoch = self.next_epoch();
        tracing::debug!(instance_id = %self.instance_id, node_id, iteration, epoch, "next emitted");
        self.route(Message::next(node_id, epoch, iteration, output));
    }

    fn progress(&self, node_id: &str, epoch: u64, percent: f32, detail: Option<String>) {
        self.publish(WorkflowEvent::Progress {
            instance_id: self.instance_id,
            node_id: node_id.to_string(),
            percent,
            detail: detail.clone(),
        });
        if self.router.has_route(node_id, MessageKind::Progress) {
            self.route(Message::progress(node_id, epoch, percent, detail));
        }
    }
}

impl std::fmt::Debug for WorkflowExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutionContext")
            .field("instance_id", &self.instance_id)
            .field("workflow_id", &self.definition.id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_types::definition::{JoinType, NodeDefinition};
    use serde_json::json;

    fn chain() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "chain")
            .with_node(NodeDefinition::new("a", "passthrough"))
            .with_node(NodeDefinition::new("b", "passthrough"))
            .with_node(NodeDefinition::new("c", "passthrough").with_join(JoinType::All))
            .connect("a", "b")
            .connect("a", "c")
            .connect("b", "c")
    }

    fn context(def: WorkflowDefinition) -> WorkflowExecutionContext {
        let graph = WorkflowGraph::build(&def).unwrap();
        WorkflowExecutionContext::new(
            Uuid::now_v7(),
            Arc::new(def),
            graph,
            &EngineConfig::default(),
            EventBus::new(16),
        )
    }

    #[test]
    fn variables_are_last_write_wins() {
        let ctx = context(chain());
        ctx.set_variable("total", json!(1));
        ctx.set_variable("total", json!(2));
        assert_eq!(ctx.get_variable("total"), Some(json!(2)));
        assert_eq!(ctx.remove_variable("total"), Some(json!(2)));
        assert!(ctx.get_variable("total").is_none());
    }

    #[test]
    fn seed_targets_entry_points_only() {
        let ctx = context(chain());
        let entries = ctx.seed(&json!({"order": 1}));
        assert_eq!(entries, vec!["a".to_string()]);
        assert_eq!(ctx.queue("a").unwrap().count(), 1);
        assert_eq!(ctx.queue("b").unwrap().count(), 0);
    }

    #[test]
    fn epochs_increase_monotonically() {
        let ctx = context(chain());
        assert_eq!(ctx.next_epoch(), 1);
        assert_eq!(ctx.next_epoch(), 2);
        assert_eq!(ctx.snapshot().epoch_counter, 2);
    }

    #[test]
    fn cancel_does_not_override_completed_nodes() {
        let ctx = context(chain());
        ctx.mark_completed("a", 0, &json!(1));
        ctx.cancel_pending(true);
        let recorded = ctx.process_cancel_messages();

        assert_eq!(recorded, 2);
        assert_eq!(ctx.node_state("a").unwrap().status, NodeStatus::Completed);
        assert_eq!(ctx.node_state("b").unwrap().status, NodeStatus::Skipped);
        assert_eq!(ctx.node_state("c").unwrap().status, NodeStatus::Skipped);
        assert_eq!(ctx.process_cancel_messages(), 0);
    }

    #[test]
    fn first_failure_is_kept() {
        let ctx = context(chain());
        assert!(ctx.record_failure(Some("b".into()), "original"));
        assert!(!ctx.record_failure(Some("c".into()), "later"));
        let failure = ctx.failure().unwrap();
        assert_eq!(failure.failed_node_id.as_deref(), Some("b"));
        assert_eq!(ctx.error().as_deref(), Some("original"));
    }

    #[test]
    fn snapshot_roundtrip_restores_in_flight_as_ready() {
        let ctx = context(chain());
        ctx.set_status(WorkflowStatus::Running);
        ctx.set_variable("k", json!("v"));
        ctx.seed(&json!(null));
        ctx.mark_completed("a", 0, &json!({"x": 1}));
        ctx.route(Message::complete("a", 0, json!({"x": 1}), None));
        let leased = ctx
            .queue("b")
            .unwrap()
            .checkout(None, "worker", Duration::from_secs(60))
            .unwrap();

        let mut checkpoint = ctx.snapshot();
        assert!(checkpoint.pending_messages["b"][0].in_flight);
        assert_eq!(checkpoint.completion_order.len(), 1);
        checkpoint.run_duration_ms = 5_000;

        let graph = WorkflowGraph::build(&checkpoint.definition).unwrap();
        let restored = WorkflowExecutionContext::from_checkpoint(
            checkpoint.clone(),
            graph,
            &EngineConfig::default(),
            EventBus::new(16),
        );

        assert_eq!(restored.instance_id(), ctx.instance_id());
        assert_eq!(restored.status(), WorkflowStatus::Running);
        assert_eq!(restored.variables(), ctx.variables());
        assert_eq!(restored.node_states(), ctx.node_states());
        assert!(restored.has_completed("a", 0));
        assert!(restored.elapsed() >= Duration::from_secs(5));

        let queue_b = restored.queue("b").unwrap();
        assert_eq!(queue_b.count_with_status(SlotStatus::Ready), 1);
        let again = queue_b
            .checkout(None, "worker", Duration::from_secs(60))
            .unwrap();
        assert_eq!(again.id, leased.id);

        // c waits on both a and b; only a has reported.
        assert_eq!(restored.router().pending_join_targets(), vec![("c".to_string(), 0)]);
    }

    #[test]
    fn completed_nodes_are_distinct_in_completion_order() {
        let ctx = context(chain());
        ctx.mark_completed("b", 1, &json!(null));
        ctx.mark_completed("a", 0, &json!(null));
        ctx.mark_completed("b", 2, &json!(null));
        assert_eq!(ctx.completed_nodes(), vec!["b".to_string(), "a".to_string()]);
    }
}
