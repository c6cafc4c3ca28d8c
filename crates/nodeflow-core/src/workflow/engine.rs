//! Workflow engine: instance lifecycle and the dispatch loop.
//!
//! Each started instance gets its own execution context and a driver task.
//! The driver repeatedly:
//!
//! 1. Consumes queued Cancel messages (no concurrency slot needed).
//! 2. Admits Ready work while global (`max_concurrency`) and per-node
//!    (`max_concurrent_executions`) slots are free, highest priority first,
//!    then oldest Ready message first.
//! 3. Runs every admitted activation on a `JoinSet`: circuit-breaker gate,
//!    retry wrapper, node body, outcome classification, routing.
//! 4. Sleeps until an activation finishes, a message is routed, the lease
//!    reclaim timer fires, or the workflow deadline passes.
//!
//! The loop ends when nothing is in flight and nothing can be admitted, or
//! when a halt (pause, cancel, unhandled failure) has drained in-flight work.
//! Failures never escape as `Err`: they are recorded on the context and
//! reported through [`ExecutionResult`].

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::FutureExt;
use nodeflow_types::checkpoint::WorkflowCheckpoint;
use nodeflow_types::config::EngineConfig;
use nodeflow_types::definition::{NodeDefinition, NodeId, WorkflowDefinition};
use nodeflow_types::event::WorkflowEvent;
use nodeflow_types::instance::{ErrorKind, NodeErrorInfo, NodeInstance};
use nodeflow_types::message::{Message, MessageKind};
use nodeflow_types::status::WorkflowStatus;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::node::{BoxNode, NodeError, NodeExecutionContext, NodeRegistry, RegistryError, SignalSink};

use super::checkpoint::{CheckpointError, CheckpointStore, MemoryCheckpointStore};
use super::circuit_breaker::CircuitBreaker;
use super::compensation::{build_compensation_context, run_compensation};
use super::context::{WorkflowExecutionContext, WorkflowFailure};
use super::dead_letter::DeadLetterReason;
use super::definition::{WorkflowError, validate_definition};
use super::retry::{RetryHandler, RetryPredicate};

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors returned by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("workflow instance {0} not found")]
    InstanceNotFound(Uuid),

    #[error("checkpoint storage is not configured")]
    CheckpointStorageNotConfigured,

    #[error("no checkpoint stored for instance {0}")]
    CheckpointNotFound(Uuid),

    #[error("instance {instance_id} is {status}: {reason}")]
    InvalidState {
        instance_id: Uuid,
        status: WorkflowStatus,
        reason: String,
    },
}

impl EngineError {
    fn invalid(instance_id: Uuid, status: WorkflowStatus, reason: impl Into<String>) -> Self {
        EngineError::InvalidState {
            instance_id,
            status,
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// Outcome of an instance once its driver has stopped.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub instance_id: Uuid,
    /// Completed, Failed, Cancelled, or Paused.
    pub status: WorkflowStatus,
    pub variables: HashMap<String, Value>,
    /// Distinct completed nodes in order of first completion.
    pub completed_nodes: Vec<NodeId>,
    /// Every recorded attempt, including failures and compensation runs.
    pub node_instances: Vec<NodeInstance>,
    pub error: Option<String>,
    pub failed_node_id: Option<NodeId>,
}

impl ExecutionResult {
    fn from_context(ctx: &WorkflowExecutionContext) -> Self {
        let failure = ctx.failure();
        Self {
            instance_id: ctx.instance_id(),
            status: ctx.status(),
            variables: ctx.variables(),
            completed_nodes: ctx.completed_nodes(),
            node_instances: ctx.node_instances(),
            error: failure.as_ref().map(|f| f.error.clone()),
            failed_node_id: failure.and_then(|f| f.failed_node_id),
        }
    }
}

// ---------------------------------------------------------------------------
// Instance runtime
// ---------------------------------------------------------------------------

/// Why the driver stops admitting work.
enum Halt {
    Pause(oneshot::Sender<Result<(), EngineError>>),
    Cancel,
    Fail,
}

#[derive(Default)]
struct Control {
    halt: Option<Halt>,
    /// Set once the driver has begun finalizing; later requests are refused.
    closed: bool,
}

/// Everything the driver and its activations share for one instance.
struct InstanceRuntime {
    context: Arc<WorkflowExecutionContext>,
    nodes: HashMap<NodeId, Arc<BoxNode>>,
    breakers: HashMap<NodeId, CircuitBreaker>,
    control: Mutex<Control>,
    finished: watch::Sender<bool>,
}

impl InstanceRuntime {
    fn lock(&self) -> std::sync::MutexGuard<'_, Control> {
        self.control.lock().expect("instance control lock poisoned")
    }

    /// Ask the driver to halt. Cancel and Fail supersede a pending pause;
    /// otherwise the first request wins. A refused pause is answered
    /// immediately.
    fn request_halt(&self, request: Halt) -> bool {
        let mut control = self.lock();
        let pausing = matches!(control.halt, Some(Halt::Pause(_)));
        let accept = !control.closed
            && (control.halt.is_none() || (pausing && !matches!(request, Halt::Pause(_))));

        let instance_id = self.context.instance_id();
        let status = self.context.status();
        if accept {
            if let Some(Halt::Pause(reply)) = control.halt.replace(request) {
                let _ = reply.send(Err(EngineError::invalid(
                    instance_id,
                    status,
                    "instance stopped before it could pause",
                )));
            }
            self.context.wake();
            return true;
        }
        if let Halt::Pause(reply) = request {
            let _ = reply.send(Err(EngineError::invalid(
                instance_id,
                status,
                "instance is already stopping",
            )));
        }
        false
    }

    /// Mark the instance Cancelled and signal its in-flight nodes.
    ///
    /// Returns `Ok(true)` when the driver is still running and will settle
    /// the cancellation, `Ok(false)` when the instance is parked in Paused
    /// and the caller settles it. Once the driver has closed on any other
    /// path the request is refused with the current status.
    fn begin_cancel(&self) -> Result<bool, WorkflowStatus> {
        let mut control = self.lock();
        let status = self.context.status();
        if status.is_terminal() {
            return Err(status);
        }
        let parked = control.closed && status == WorkflowStatus::Paused && self.is_finished();
        if control.closed && !parked {
            return Err(status);
        }

        self.context.set_status(WorkflowStatus::Cancelled);
        self.context.execution_token().cancel();
        self.context.cancel_pending(false);
        if parked {
            return Ok(false);
        }

        if let Some(Halt::Pause(reply)) = control.halt.replace(Halt::Cancel) {
            let _ = reply.send(Err(EngineError::invalid(
                self.context.instance_id(),
                WorkflowStatus::Cancelled,
                "instance stopped before it could pause",
            )));
        }
        self.context.wake();
        Ok(true)
    }

    fn halting(&self) -> bool {
        self.lock().halt.is_some()
    }

    /// Refuse further halt requests and take the pending one.
    fn close(&self) -> Option<Halt> {
        let mut control = self.lock();
        control.closed = true;
        control.halt.take()
    }

    fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }
}

/// One admitted unit of work: a node, an epoch, its input and the messages
/// that triggered it.
struct Activation {
    node_id: NodeId,
    epoch: u64,
    input: Value,
    triggers: Vec<Arc<Message>>,
}

enum Outcome {
    Completed,
    /// Failed and routed over a failure connection.
    Failed,
    Cancelled,
    /// Failed with no failure connection.
    Unhandled,
    Panicked,
}

struct ActivationReport {
    node_id: NodeId,
    outcome: Outcome,
}

/// Running activations: per-node counts and the node owning each task.
///
/// Slots are released by task id so a task that ends in a `JoinError`
/// still frees its node's slot.
#[derive(Debug, Default)]
struct Slots {
    per_node: HashMap<NodeId, u32>,
    owners: HashMap<task::Id, NodeId>,
}

impl Slots {
    fn running(&self, node_id: &str) -> u32 {
        self.per_node.get(node_id).copied().unwrap_or(0)
    }

    fn acquire(&mut self, task_id: task::Id, node_id: NodeId) {
        *self.per_node.entry(node_id.clone()).or_default() += 1;
        self.owners.insert(task_id, node_id);
    }

    /// Free the slot of a joined task and return the node that held it.
    fn release<T>(&mut self, joined: &Result<(task::Id, T), JoinError>) -> Option<NodeId> {
        let task_id = match joined {
            Ok((id, _)) => *id,
            Err(error) => error.id(),
        };
        let node_id = self.owners.remove(&task_id)?;
        if let Some(count) = self.per_node.get_mut(&node_id) {
            *count = count.saturating_sub(1);
        }
        Some(node_id)
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Executes workflow definitions.
///
/// Generic over `S: CheckpointStore`; without a store the engine still runs
/// workflows, but pause and resume are unavailable.
pub struct WorkflowEngine<S: CheckpointStore = MemoryCheckpointStore> {
    inner: Arc<EngineInner<S>>,
}

struct EngineInner<S> {
    registry: NodeRegistry,
    config: EngineConfig,
    store: Option<S>,
    events: EventBus,
    instances: DashMap<Uuid, Arc<InstanceRuntime>>,
}

impl<S: CheckpointStore> Clone for WorkflowEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl WorkflowEngine<MemoryCheckpointStore> {
    /// Engine without checkpoint storage.
    pub fn new(registry: NodeRegistry, config: EngineConfig) -> Self {
        Self::build(registry, config, None)
    }
}

impl<S: CheckpointStore + 'static> WorkflowEngine<S> {
    /// Engine persisting checkpoints into `store`.
    pub fn with_checkpoint_store(registry: NodeRegistry, config: EngineConfig, store: S) -> Self {
        Self::build(registry, config, Some(store))
    }

    fn build(registry: NodeRegistry, config: EngineConfig, store: Option<S>) -> Self {
        let events = EventBus::new(config.event_buffer);
        Self {
            inner: Arc::new(EngineInner {
                registry,
                config,
                store,
                events,
                instances: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Receiver for lifecycle events of every instance.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.inner.events.subscribe()
    }

    /// Validate `definition`, seed its entry points with `input` and start
    /// dispatching in the background.
    pub async fn start(
        &self,
        definition: WorkflowDefinition,
        input: Value,
    ) -> Result<Uuid, EngineError> {
        let graph = validate_definition(&definition)?;
        let nodes = self.inner.instantiate(&definition)?;
        validate_ports(&definition, &nodes)?;

        let instance_id = Uuid::now_v7();
        let context = Arc::new(WorkflowExecutionContext::new(
            instance_id,
            Arc::new(definition),
            graph,
            &self.inner.config,
            self.inner.events.clone(),
        ));
        let entries = context.seed(&input);
        context.set_status(WorkflowStatus::Running);

        let runtime = self.inner.register(Arc::clone(&context), nodes);
        self.inner.checkpoint(&context).await;

        context.publish(WorkflowEvent::WorkflowStarted {
            instance_id,
            workflow_id: context.definition().id.clone(),
        });
        tracing::info!(
            %instance_id,
            workflow_id = %context.definition().id,
            entry_points = entries.len(),
            "workflow started"
        );

        self.inner.spawn(runtime);
        Ok(instance_id)
    }

    /// Start an instance and wait for its driver to stop.
    pub async fn run(
        &self,
        definition: WorkflowDefinition,
        input: Value,
    ) -> Result<ExecutionResult, EngineError> {
        let instance_id = self.start(definition, input).await?;
        self.wait(instance_id).await
    }

    /// Wait until the instance's driver stops (terminal status or paused).
    pub async fn wait(&self, instance_id: Uuid) -> Result<ExecutionResult, EngineError> {
        let runtime = self.inner.runtime(instance_id)?;
        let mut finished = runtime.finished.subscribe();
        let _ = finished.wait_for(|done| *done).await;
        Ok(ExecutionResult::from_context(&runtime.context))
    }

    pub fn status(&self, instance_id: Uuid) -> Result<WorkflowStatus, EngineError> {
        Ok(self.inner.runtime(instance_id)?.context.status())
    }

    /// Live context of an instance, for querying variables, node states,
    /// dead letters and attempt history.
    pub fn context(&self, instance_id: Uuid) -> Result<Arc<WorkflowExecutionContext>, EngineError> {
        Ok(Arc::clone(&self.inner.runtime(instance_id)?.context))
    }

    /// Stop admitting work, let in-flight activations finish, then persist a
    /// checkpoint and mark the instance Paused.
    pub async fn pause(&self, instance_id: Uuid) -> Result<(), EngineError> {
        if self.inner.store.is_none() {
            return Err(EngineError::CheckpointStorageNotConfigured);
        }
        let runtime = self.inner.runtime(instance_id)?;
        let status = runtime.context.status();
        if status != WorkflowStatus::Running || runtime.is_finished() {
            return Err(EngineError::invalid(instance_id, status, "only running instances can pause"));
        }

        let (reply, response) = oneshot::channel();
        runtime.request_halt(Halt::Pause(reply));
        response.await.map_err(|_| {
            EngineError::invalid(instance_id, runtime.context.status(), "driver stopped without pausing")
        })?
    }

    /// Rebuild an instance from its stored checkpoint and continue it.
    pub async fn resume(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let store = self
            .inner
            .store
            .as_ref()
            .ok_or(EngineError::CheckpointStorageNotConfigured)?;
        if let Some(existing) = self.inner.instances.get(&instance_id).map(|r| Arc::clone(r.value())) {
            if !existing.is_finished() {
                return Err(EngineError::invalid(
                    instance_id,
                    existing.context.status(),
                    "instance is still running",
                ));
            }
        }

        let checkpoint = store
            .load(instance_id)
            .await?
            .ok_or(EngineError::CheckpointNotFound(instance_id))?;
        if checkpoint.status.is_terminal() {
            return Err(EngineError::invalid(
                instance_id,
                checkpoint.status,
                "terminal instances cannot resume",
            ));
        }
        self.inner.restore(checkpoint).await
    }

    /// Resume every stored instance whose status is not terminal. Returns
    /// the ids that were resumed.
    pub async fn recover_incomplete_workflows(&self) -> Result<Vec<Uuid>, EngineError> {
        let store = self
            .inner
            .store
            .as_ref()
            .ok_or(EngineError::CheckpointStorageNotConfigured)?;

        let mut recovered = Vec::new();
        for checkpoint in store.list().await? {
            let instance_id = checkpoint.instance_id;
            if checkpoint.status.is_terminal() {
                continue;
            }
            let active = self
                .inner
                .instances
                .get(&instance_id)
                .is_some_and(|r| !r.is_finished());
            if active {
                continue;
            }
            match self.inner.restore(checkpoint).await {
                Ok(()) => recovered.push(instance_id),
                Err(error) => {
                    tracing::warn!(%instance_id, %error, "failed to recover workflow instance")
                }
            }
        }

        tracing::info!(count = recovered.len(), "incomplete workflows recovered");
        Ok(recovered)
    }

    /// Cancel an instance.
    ///
    /// Queued work is cleared into the dead-letter queue and in-flight nodes
    /// are signalled; they finish on their own schedule. Recorded node
    /// history is kept. A paused instance known only to the checkpoint store
    /// has its stored checkpoint marked Cancelled.
    pub async fn cancel(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let runtime = self
            .inner
            .instances
            .get(&instance_id)
            .map(|r| Arc::clone(r.value()));

        let Some(runtime) = runtime else {
            return self.inner.cancel_stored(instance_id).await;
        };

        let driver_running = runtime
            .begin_cancel()
            .map_err(|status| EngineError::invalid(instance_id, status, "instance already finished"))?;
        if !driver_running {
            // Paused: no driver is running, settle here.
            self.inner.finish_cancelled(&runtime.context).await;
        }
        tracing::info!(%instance_id, "workflow cancellation requested");
        Ok(())
    }

    /// Forget an instance. A running instance is cancelled first.
    pub fn dispose(&self, instance_id: Uuid) -> bool {
        let Some((_, runtime)) = self.inner.instances.remove(&instance_id) else {
            return false;
        };
        if !runtime.is_finished() {
            let _ = runtime.begin_cancel();
        }
        tracing::debug!(%instance_id, "workflow instance disposed");
        true
    }
}

fn validate_ports(
    definition: &WorkflowDefinition,
    nodes: &HashMap<NodeId, Arc<BoxNode>>,
) -> Result<(), WorkflowError> {
    for conn in &definition.connections {
        let Some(port) = &conn.source_port else {
            continue;
        };
        let declared = nodes
            .get(&conn.source_node_id)
            .map(|n| n.available_ports())
            .unwrap_or_default();
        if !declared.iter().any(|p| p == port) {
            return Err(WorkflowError::ValidationError(format!(
                "connection '{}' -> '{}' uses port '{port}' not declared by '{}'",
                conn.source_node_id, conn.target_node_id, conn.source_node_id
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// EngineInner: instance management
// ---------------------------------------------------------------------------

impl<S: CheckpointStore + 'static> EngineInner<S> {
    fn runtime(&self, instance_id: Uuid) -> Result<Arc<InstanceRuntime>, EngineError> {
        self.instances
            .get(&instance_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or(EngineError::InstanceNotFound(instance_id))
    }

    fn instantiate(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<HashMap<NodeId, Arc<BoxNode>>, RegistryError> {
        definition
            .nodes
            .iter()
            .map(|n| Ok((n.id.clone(), Arc::new(self.registry.create(n)?))))
            .collect()
    }

    fn register(
        &self,
        context: Arc<WorkflowExecutionContext>,
        nodes: HashMap<NodeId, Arc<BoxNode>>,
    ) -> Arc<InstanceRuntime> {
        let breakers = context
            .definition()
            .nodes
            .iter()
            .filter_map(|n| {
                n.circuit_breaker
                    .clone()
                    .map(|policy| (n.id.clone(), CircuitBreaker::new(policy)))
            })
            .collect();
        let (finished, _) = watch::channel(false);
        let runtime = Arc::new(InstanceRuntime {
            context,
            nodes,
            breakers,
            control: Mutex::new(Control::default()),
            finished,
        });
        self.instances
            .insert(runtime.context.instance_id(), Arc::clone(&runtime));
        runtime
    }

    fn spawn(self: &Arc<Self>, runtime: Arc<InstanceRuntime>) {
        let span = tracing::info_span!(
            "workflow",
            instance_id = %runtime.context.instance_id(),
            workflow_id = %runtime.context.definition().id,
        );
        tokio::spawn(Arc::clone(self).drive(runtime).instrument(span));
    }

    async fn restore(
        self: &Arc<Self>,
        checkpoint: WorkflowCheckpoint,
    ) -> Result<(), EngineError> {
        let graph = validate_definition(&checkpoint.definition)?;
        let nodes = self.instantiate(&checkpoint.definition)?;
        let instance_id = checkpoint.instance_id;

        let context = Arc::new(WorkflowExecutionContext::from_checkpoint(
            checkpoint,
            graph,
            &self.config,
            self.events.clone(),
        ));
        context.set_status(WorkflowStatus::Running);
        let runtime = self.register(Arc::clone(&context), nodes);
        self.checkpoint(&context).await;

        context.publish(WorkflowEvent::WorkflowResumed {
            instance_id,
            workflow_id: context.definition().id.clone(),
        });
        tracing::info!(
            %instance_id,
            workflow_id = %context.definition().id,
            completed = context.completed_nodes().len(),
            "workflow resumed"
        );
        self.spawn(runtime);
        Ok(())
    }

    async fn cancel_stored(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let Some(store) = &self.store else {
            return Err(EngineError::InstanceNotFound(instance_id));
        };
        let mut checkpoint = store
            .load(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))?;
        if checkpoint.status.is_terminal() {
            return Err(EngineError::invalid(
                instance_id,
                checkpoint.status,
                "instance already finished",
            ));
        }
        let now = chrono::Utc::now();
        checkpoint.status = WorkflowStatus::Cancelled;
        checkpoint.updated_at = now;
        checkpoint.completed_at = Some(now);
        store.save(&checkpoint).await?;
        tracing::info!(%instance_id, "stored workflow marked cancelled");
        Ok(())
    }

    // -- checkpointing ------------------------------------------------------

    async fn persist(&self, ctx: &WorkflowExecutionContext) -> Result<(), EngineError> {
        let Some(store) = &self.store else {
            return Err(EngineError::CheckpointStorageNotConfigured);
        };
        store.save(&ctx.snapshot()).await?;
        tracing::debug!(instance_id = %ctx.instance_id(), status = %ctx.status(), "checkpoint saved");
        Ok(())
    }

    /// Save a checkpoint when auto-checkpointing is on and a store exists.
    async fn checkpoint(&self, ctx: &WorkflowExecutionContext) {
        if !self.config.auto_checkpoint || self.store.is_none() {
            return;
        }
        if let Err(error) = self.persist(ctx).await {
            tracing::warn!(instance_id = %ctx.instance_id(), %error, "checkpoint save failed");
        }
    }

    // -- driver -------------------------------------------------------------

    async fn drive(self: Arc<Self>, runtime: Arc<InstanceRuntime>) {
        let ctx = Arc::clone(&runtime.context);
        let instance_id = ctx.instance_id();
        let mut tasks: JoinSet<ActivationReport> = JoinSet::new();
        let mut slots = Slots::default();

        let mut reclaim = tokio::time::interval(self.config.reclaim_interval());
        reclaim.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let limit = ctx.definition().timeout_ms.map(Duration::from_millis);
        let remaining = limit
            .map(|l| l.saturating_sub(ctx.elapsed()))
            .unwrap_or(Duration::from_secs(86_400));
        let deadline = tokio::time::sleep(remaining);
        tokio::pin!(deadline);
        let mut timed_out = false;

        loop {
            ctx.process_cancel_messages();
            if !runtime.halting() {
                self.dispatch(&runtime, &mut tasks, &mut slots);
            }
            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                Some(joined) = tasks.join_next_with_id() => {
                    self.on_report(&runtime, joined, &mut slots).await;
                }
                _ = ctx.woken() => {}
                _ = reclaim.tick() => {
                    let reclaimed = ctx.reclaim_expired();
                    if reclaimed > 0 {
                        tracing::warn!(%instance_id, reclaimed, "expired leases reclaimed");
                    }
                }
                _ = &mut deadline, if limit.is_some() && !timed_out => {
                    timed_out = true;
                    let limit = limit.unwrap_or_default();
                    ctx.record_failure(None, format!("workflow timed out after {limit:?}"));
                    tracing::warn!(%instance_id, ?limit, "workflow timed out");
                    runtime.request_halt(Halt::Fail);
                    ctx.execution_token().cancel();
                }
            }
        }

        self.finalize(&runtime).await;
    }

    /// Admit Ready work while slots are free.
    fn dispatch(
        &self,
        runtime: &Arc<InstanceRuntime>,
        tasks: &mut JoinSet<ActivationReport>,
        slots: &mut Slots,
    ) {
        let ctx = &runtime.context;
        let definition = ctx.definition();
        let global = definition.max_concurrency as usize;

        loop {
            if global > 0 && tasks.len() >= global {
                break;
            }

            let mut candidates: Vec<(&NodeDefinition, Instant)> = definition
                .nodes
                .iter()
                .filter_map(|node| {
                    let limit = node.max_concurrent_executions;
                    if limit > 0 && slots.running(&node.id) >= limit {
                        return None;
                    }
                    oldest_dispatchable(ctx, &node.id).map(|at| (node, at))
                })
                .collect();
            if candidates.is_empty() {
                break;
            }
            candidates.sort_by(|a, b| b.0.priority.cmp(&a.0.priority).then(a.1.cmp(&b.1)));

            let node = candidates[0].0;
            let Some(activation) = checkout(ctx, node) else {
                continue;
            };

            tracing::debug!(
                instance_id = %ctx.instance_id(),
                node_id = %node.id,
                epoch = activation.epoch,
                in_flight = tasks.len() + 1,
                "activation dispatched"
            );

            let node_id = activation.node_id.clone();
            let span = tracing::debug_span!("node", node_id = %node_id, epoch = activation.epoch);
            let task_runtime = Arc::clone(runtime);
            let handle = tasks.spawn(
                async move {
                    let outcome = AssertUnwindSafe(run_activation(task_runtime, activation))
                        .catch_unwind()
                        .await
                        .unwrap_or(Outcome::Panicked);
                    ActivationReport { node_id, outcome }
                }
                .instrument(span),
            );
            slots.acquire(handle.id(), node.id.clone());
        }
    }

    async fn on_report(
        &self,
        runtime: &Arc<InstanceRuntime>,
        joined: Result<(task::Id, ActivationReport), JoinError>,
        slots: &mut Slots,
    ) {
        let ctx = &runtime.context;
        let instance_id = ctx.instance_id();
        let owner = slots.release(&joined);
        let report = match joined {
            Ok((_, report)) => report,
            Err(error) => {
                tracing::error!(
                    %instance_id,
                    node_id = owner.as_deref().unwrap_or("-"),
                    %error,
                    "activation task aborted"
                );
                return;
            }
        };

        match report.outcome {
            Outcome::Completed => self.checkpoint(ctx).await,
            Outcome::Unhandled => {
                runtime.request_halt(Halt::Fail);
                ctx.execution_token().cancel();
            }
            Outcome::Panicked => {
                let message = format!("node '{}' panicked", report.node_id);
                tracing::error!(%instance_id, node_id = %report.node_id, "node body panicked");
                ctx.mark_failed(
                    &report.node_id,
                    NodeErrorInfo {
                        kind: ErrorKind::NodeExecution,
                        message: message.clone(),
                        category: None,
                    },
                );
                ctx.record_failure(Some(report.node_id.clone()), message);
                runtime.request_halt(Halt::Fail);
                ctx.execution_token().cancel();
            }
            Outcome::Failed | Outcome::Cancelled => {}
        }
    }

    // -- finalization -------------------------------------------------------

    async fn finalize(&self, runtime: &Arc<InstanceRuntime>) {
        let ctx = &runtime.context;
        match runtime.close() {
            Some(Halt::Pause(reply)) => {
                ctx.set_status(WorkflowStatus::Paused);
                let saved = self.persist(ctx).await;
                if saved.is_ok() {
                    ctx.publish(WorkflowEvent::WorkflowPaused {
                        instance_id: ctx.instance_id(),
                    });
                    tracing::info!(instance_id = %ctx.instance_id(), "workflow paused");
                }
                let _ = reply.send(saved);
            }
            Some(Halt::Cancel) => self.finish_cancelled(ctx).await,
            _ if ctx.status() == WorkflowStatus::Cancelled => self.finish_cancelled(ctx).await,
            Some(Halt::Fail) => self.finish_failed(runtime).await,
            None => self.finish_completed(ctx).await,
        }
        runtime.finished.send_replace(true);
    }

    async fn finish_completed(&self, ctx: &WorkflowExecutionContext) {
        let leftover = ctx.dead_letter_remaining(|node_id| {
            if ctx.router().requires_all(node_id) {
                DeadLetterReason::JoinIncomplete
            } else {
                DeadLetterReason::Undeliverable
            }
        });
        if leftover > 0 {
            tracing::warn!(instance_id = %ctx.instance_id(), leftover, "undispatchable messages dead-lettered");
        }

        ctx.set_status(WorkflowStatus::Completed);
        let duration_ms = ctx.elapsed().as_millis() as u64;
        ctx.publish(WorkflowEvent::WorkflowCompleted {
            instance_id: ctx.instance_id(),
            duration_ms,
        });
        tracing::info!(instance_id = %ctx.instance_id(), duration_ms, "workflow completed");
        self.checkpoint(ctx).await;
    }

    async fn finish_cancelled(&self, ctx: &WorkflowExecutionContext) {
        ctx.process_cancel_messages();
        ctx.dead_letter_remaining(|_| DeadLetterReason::Cancelled);
        ctx.set_status(WorkflowStatus::Cancelled);
        ctx.publish(WorkflowEvent::WorkflowCancelled {
            instance_id: ctx.instance_id(),
        });
        tracing::info!(instance_id = %ctx.instance_id(), "workflow cancelled");
        self.checkpoint(ctx).await;
    }

    /// Compensate, skip everything that has not run, and mark Failed.
    async fn finish_failed(&self, runtime: &Arc<InstanceRuntime>) {
        let ctx = &runtime.context;
        let instance_id = ctx.instance_id();
        let failure = ctx.failure().unwrap_or(WorkflowFailure {
            failed_node_id: None,
            error: "workflow failed".to_string(),
        });

        if let Some(failed_node_id) = &failure.failed_node_id {
            let partial_output = ctx
                .node_instances()
                .into_iter()
                .rev()
                .find(|i| &i.node_id == failed_node_id)
                .and_then(|i| i.output);
            let compensation = build_compensation_context(
                ctx.definition(),
                ctx.router().graph(),
                &ctx.completion_order(),
                failed_node_id,
                &failure.error,
                partial_output,
            );
            if !compensation.nodes_to_compensate.is_empty() {
                tracing::info!(
                    %instance_id,
                    failed_node_id = %failed_node_id,
                    count = compensation.nodes_to_compensate.len(),
                    "running compensation"
                );
                let records = run_compensation(ctx, &runtime.nodes, &compensation).await;
                ctx.record_compensations(records);
            }
        }

        ctx.cancel_pending(true);
        ctx.process_cancel_messages();
        ctx.dead_letter_remaining(|_| DeadLetterReason::Cancelled);

        ctx.set_status(WorkflowStatus::Failed);
        ctx.publish(WorkflowEvent::WorkflowFailed {
            instance_id,
            failed_node_id: failure.failed_node_id.clone(),
            error: failure.error.clone(),
        });
        tracing::warn!(
            %instance_id,
            failed_node_id = failure.failed_node_id.as_deref().unwrap_or("-"),
            error = %failure.error,
            "workflow failed"
        );
        self.checkpoint(ctx).await;
    }
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

fn not_cancel(message: &Message) -> bool {
    message.kind() != MessageKind::Cancel
}

/// Messages an All-join node runs on outside its epoch barrier.
fn bypasses_join(message: &Message) -> bool {
    message.is_seed() || message.kind() == MessageKind::Progress
}

/// Enqueue time of the oldest message that could start an activation.
fn oldest_dispatchable(ctx: &WorkflowExecutionContext, node_id: &str) -> Option<Instant> {
    let queue = ctx.queue(node_id)?;
    if ctx.router().requires_all(node_id) {
        if ctx.router().has_ready_epoch(node_id) {
            queue.oldest_ready(not_cancel)
        } else {
            queue.oldest_ready(bypasses_join)
        }
    } else {
        queue.oldest_ready(not_cancel)
    }
}

/// Lease the trigger message(s) for one activation of `node`.
///
/// All-join nodes take every message of their oldest complete epoch and
/// receive an object keyed by source node; seeds and Progress messages run
/// them on their own. Other nodes take one message.
/// Activations whose (node, epoch) already completed are acknowledged and
/// dropped.
fn checkout(ctx: &WorkflowExecutionContext, node: &NodeDefinition) -> Option<Activation> {
    let queue = ctx.queue(&node.id)?;
    let handler = format!("{}:{}", ctx.instance_id(), node.id);
    let lease = ctx.lease_duration();

    let (epoch, input, triggers) = if ctx.router().requires_all(&node.id) {
        match ctx.router().take_ready_epoch(&node.id) {
            Some(epoch) => {
                let mut triggers = Vec::new();
                while let Some(message) = queue.checkout_where(&handler, lease, |m| {
                    m.epoch == epoch && not_cancel(m) && !bypasses_join(m)
                }) {
                    triggers.push(message);
                }
                if triggers.is_empty() {
                    return None;
                }
                let mut input = Map::new();
                for message in &triggers {
                    input.insert(message.node_id.clone(), message.data());
                }
                (epoch, Value::Object(input), triggers)
            }
            None => {
                let message = queue.checkout_where(&handler, lease, bypasses_join)?;
                (message.epoch, message.data(), vec![message])
            }
        }
    } else {
        let message = queue.checkout_where(&handler, lease, not_cancel)?;
        (message.epoch, message.data(), vec![message])
    };

    let repeatable = triggers.iter().all(|m| m.kind() == MessageKind::Progress);
    if !repeatable && ctx.has_completed(&node.id, epoch) {
        tracing::debug!(
            instance_id = %ctx.instance_id(),
            node_id = %node.id,
            epoch,
            "activation already completed, skipping"
        );
        for message in &triggers {
            queue.acknowledge(message.id);
        }
        return None;
    }

    Some(Activation {
        node_id: node.id.clone(),
        epoch,
        input,
        triggers,
    })
}

// ---------------------------------------------------------------------------
// Activation pipeline
// ---------------------------------------------------------------------------

/// Circuit-breaker gate, retry wrapper, node body, outcome routing.
async fn run_activation(runtime: Arc<InstanceRuntime>, activation: Activation) -> Outcome {
    let ctx = &*runtime.context;
    let Activation {
        node_id,
        epoch,
        input,
        triggers,
    } = activation;
    let started = Instant::now();

    let (Some(definition), Some(node)) = (ctx.definition().node(&node_id), runtime.nodes.get(&node_id))
    else {
        return settle(
            ctx,
            &node_id,
            epoch,
            Err(NodeError::Initialization(format!("node '{node_id}' is not instantiated"))),
            &triggers,
            started,
        );
    };

    let token = ctx.execution_token().child_token();
    let timeout = definition
        .timeout_ms
        .map(Duration::from_millis)
        .or(ctx.default_node_timeout());
    let sink: Arc<dyn SignalSink> = runtime.context.clone();
    let base = NodeExecutionContext::new(ctx.instance_id(), node_id.clone(), epoch, input)
        .with_sink(Arc::clone(&sink));

    let breaker = runtime.breakers.get(&node_id);
    let result = if breaker.is_some_and(|b| !b.try_acquire()) {
        tracing::debug!(instance_id = %ctx.instance_id(), node_id = %node_id, "circuit open, call rejected");
        Err(NodeError::CircuitOpen(node_id.clone()))
    } else {
        let node_ref: &BoxNode = node;
        let base_ref = &base;
        let token_ref = &token;
        let veto: &RetryPredicate<'_> = &|error: &NodeError| node_ref.should_retry(error);
        let result = RetryHandler::run(
            definition.retry.as_ref(),
            Some(veto),
            &token,
            |attempt| execute_attempt(ctx, node_ref, definition, base_ref, attempt, timeout, token_ref),
            |attempt, error, delay| {
                if let Some(delay) = delay {
                    tracing::debug!(
                        instance_id = %ctx.instance_id(),
                        node_id = %definition.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "node attempt failed, will retry"
                    );
                    ctx.publish(WorkflowEvent::NodeFailed {
                        instance_id: ctx.instance_id(),
                        node_id: definition.id.clone(),
                        epoch,
                        error: error.to_string(),
                        will_retry: true,
                    });
                }
            },
        )
        .await;

        if let Some(breaker) = breaker {
            match &result {
                Ok(_) => breaker.record_success(),
                Err(error) if !error.is_cancelled() => {
                    if breaker.record_failure() {
                        tracing::warn!(instance_id = %ctx.instance_id(), node_id = %node_id, "circuit opened");
                        ctx.publish(WorkflowEvent::CircuitOpened {
                            instance_id: ctx.instance_id(),
                            node_id: node_id.clone(),
                        });
                    }
                }
                Err(_) => {}
            }
        }
        result
    };

    let result = match (result, &definition.fallback_node_id) {
        (Err(NodeError::CircuitOpen(_)), Some(fallback_id)) => {
            run_fallback(&runtime, fallback_id, &base, sink, &token).await
        }
        (result, _) => result,
    };

    settle(ctx, &node_id, epoch, result, &triggers, started)
}

/// Execute one attempt of `node`, recording it in the instance history.
async fn execute_attempt(
    ctx: &WorkflowExecutionContext,
    node: &BoxNode,
    definition: &NodeDefinition,
    base: &NodeExecutionContext,
    attempt: u32,
    timeout: Option<Duration>,
    token: &CancellationToken,
) -> Result<NodeExecutionContext, NodeError> {
    let mut node_ctx = base.for_attempt(attempt);
    ctx.mark_attempt(&definition.id);
    ctx.publish(WorkflowEvent::NodeStarted {
        instance_id: ctx.instance_id(),
        node_id: definition.id.clone(),
        epoch: base.epoch,
        attempt,
    });
    let record = NodeInstance::started(definition.id.clone(), base.epoch, attempt);

    let execution = node.execute(ctx, &mut node_ctx, token.clone());
    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, execution)
            .await
            .unwrap_or(Err(NodeError::Timeout(limit))),
        None => execution.await,
    };
    let result = result.and_then(|()| resolve_port(node, &mut node_ctx));

    match result {
        Ok(()) => {
            ctx.record_instance(
                record.complete(node_ctx.output_data.clone(), node_ctx.output_port.clone()),
            );
            Ok(node_ctx)
        }
        Err(error) => {
            let mut record = record;
            if !node_ctx.output_data.is_null() {
                record.output = Some(node_ctx.output_data.clone());
            }
            ctx.record_instance(record.fail(error.to_info()));
            Err(error)
        }
    }
}

/// Default to the first declared port; reject undeclared ones.
fn resolve_port(node: &BoxNode, node_ctx: &mut NodeExecutionContext) -> Result<(), NodeError> {
    let ports = node.available_ports();
    match &node_ctx.output_port {
        Some(port) if !ports.iter().any(|p| p == port) => Err(NodeError::categorized(
            format!("output port '{port}' is not declared by node '{}'", node_ctx.node_id),
            "port",
        )),
        Some(_) => Ok(()),
        None => {
            node_ctx.output_port = ports.into_iter().next();
            Ok(())
        }
    }
}

/// Substitute the fallback node's output for a node whose circuit is open.
async fn run_fallback(
    runtime: &InstanceRuntime,
    fallback_id: &str,
    base: &NodeExecutionContext,
    sink: Arc<dyn SignalSink>,
    token: &CancellationToken,
) -> Result<NodeExecutionContext, NodeError> {
    let ctx = &*runtime.context;
    let (Some(definition), Some(fallback)) =
        (ctx.definition().node(fallback_id), runtime.nodes.get(fallback_id))
    else {
        return Err(NodeError::CircuitOpen(base.node_id.clone()));
    };
    tracing::info!(
        instance_id = %ctx.instance_id(),
        node_id = %base.node_id,
        fallback_id,
        "circuit open, running fallback"
    );

    let fallback_base =
        NodeExecutionContext::new(ctx.instance_id(), fallback_id, base.epoch, base.input_data.clone())
            .with_sink(sink);
    let timeout = definition
        .timeout_ms
        .map(Duration::from_millis)
        .or(ctx.default_node_timeout());
    let mut node_ctx =
        execute_attempt(ctx, fallback, definition, &fallback_base, 1, timeout, token).await?;
    ctx.mark_completed(fallback_id, base.epoch, &node_ctx.output_data);

    node_ctx.node_id = base.node_id.clone();
    node_ctx.output_port = None;
    Ok(node_ctx)
}

/// Record the activation outcome, route the resulting message and
/// acknowledge the triggers.
fn settle(
    ctx: &WorkflowExecutionContext,
    node_id: &str,
    epoch: u64,
    result: Result<NodeExecutionContext, NodeError>,
    triggers: &[Arc<Message>],
    started: Instant,
) -> Outcome {
    let instance_id = ctx.instance_id();
    let outcome = match result {
        Ok(node_ctx) => {
            if triggers.iter().all(|m| m.kind() == MessageKind::Progress) {
                ctx.mark_progress_handled(node_id, epoch, &node_ctx.output_data);
            } else {
                ctx.mark_completed(node_id, epoch, &node_ctx.output_data);
            }
            let duration_ms = started.elapsed().as_millis() as u64;
            ctx.publish(WorkflowEvent::NodeCompleted {
                instance_id,
                node_id: node_id.to_string(),
                epoch,
                duration_ms,
            });
            tracing::debug!(%instance_id, node_id, epoch, duration_ms, "node completed");
            ctx.route(Message::complete(
                node_id,
                epoch,
                node_ctx.output_data,
                node_ctx.output_port,
            ));
            Outcome::Completed
        }
        Err(error) if error.is_cancelled() => {
            if ctx.mark_cancelled(node_id, false) {
                ctx.publish(WorkflowEvent::NodeCancelled {
                    instance_id,
                    node_id: node_id.to_string(),
                    cascade_from_failure: false,
                });
            }
            tracing::debug!(%instance_id, node_id, epoch, "node cancelled");
            if !ctx.execution_token().is_cancelled() {
                ctx.route(Message::cancel(node_id, epoch, false));
            }
            Outcome::Cancelled
        }
        Err(error) => {
            ctx.mark_failed(node_id, error.to_info());
            ctx.publish(WorkflowEvent::NodeFailed {
                instance_id,
                node_id: node_id.to_string(),
                epoch,
                error: error.to_string(),
                will_retry: false,
            });
            let message = Message::fail(
                node_id,
                epoch,
                error.to_string(),
                error.category().map(str::to_string),
            );
            if ctx.router().has_route(node_id, MessageKind::Fail) {
                tracing::warn!(%instance_id, node_id, epoch, %error, "node failed, routing failure");
                ctx.route(message);
                Outcome::Failed
            } else {
                tracing::error!(%instance_id, node_id, epoch, %error, "unhandled node failure");
                ctx.dead_letters()
                    .push(Arc::new(message), None, DeadLetterReason::Unhandled);
                ctx.record_failure(Some(node_id.to_string()), error.to_string());
                Outcome::Unhandled
            }
        }
    };

    if let Some(queue) = ctx.queue(node_id) {
        for message in triggers {
            if !queue.acknowledge(message.id) {
                tracing::warn!(%instance_id, node_id, message_id = %message.id, "trigger was not in flight at acknowledge");
            }
        }
    }
    outcome
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
