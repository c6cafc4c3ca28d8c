//! Checkpoint storage port and the volatile in-memory store.
//!
//! The engine persists `WorkflowCheckpoint` documents through the
//! `CheckpointStore` trait. `MemoryCheckpointStore` lives here for tests and
//! single-process embedding; the durable file store lives in
//! `nodeflow-infra`.

use std::sync::Arc;

use dashmap::DashMap;
use nodeflow_types::checkpoint::WorkflowCheckpoint;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// CheckpointError
// ---------------------------------------------------------------------------

/// Errors raised by checkpoint storage.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("checkpoint for instance {instance_id} is corrupted: {reason}")]
    Corrupted { instance_id: Uuid, reason: String },
}

// ---------------------------------------------------------------------------
// CheckpointStore trait
// ---------------------------------------------------------------------------

/// Storage for workflow checkpoints, keyed by instance id.
///
/// Uses RPITIT for async methods. Implementations must tolerate concurrent
/// save/load without exposing a partially written checkpoint.
pub trait CheckpointStore: Send + Sync {
    /// Insert or replace the checkpoint for `checkpoint.instance_id`.
    fn save(
        &self,
        checkpoint: &WorkflowCheckpoint,
    ) -> impl std::future::Future<Output = Result<(), CheckpointError>> + Send;

    fn load(
        &self,
        instance_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowCheckpoint>, CheckpointError>> + Send;

    /// Remove a checkpoint. Returns whether one existed.
    fn delete(
        &self,
        instance_id: Uuid,
    ) -> impl std::future::Future<Output = Result<bool, CheckpointError>> + Send;

    fn list(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowCheckpoint>, CheckpointError>> + Send;
}

impl<T: CheckpointStore> CheckpointStore for Arc<T> {
    async fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), CheckpointError> {
        (**self).save(checkpoint).await
    }

    async fn load(&self, instance_id: Uuid) -> Result<Option<WorkflowCheckpoint>, CheckpointError> {
        (**self).load(instance_id).await
    }

    async fn delete(&self, instance_id: Uuid) -> Result<bool, CheckpointError> {
        (**self).delete(instance_id).await
    }

    async fn list(&self) -> Result<Vec<WorkflowCheckpoint>, CheckpointError> {
        (**self).list().await
    }
}

// ---------------------------------------------------------------------------
// MemoryCheckpointStore
// ---------------------------------------------------------------------------

/// Volatile checkpoint store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: DashMap<Uuid, WorkflowCheckpoint>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), CheckpointError> {
        self.checkpoints
            .insert(checkpoint.instance_id, checkpoint.clone());
        tracing::debug!(
            instance_id = %checkpoint.instance_id,
            status = %checkpoint.status,
            "checkpoint saved in memory"
        );
        Ok(())
    }

    async fn load(&self, instance_id: Uuid) -> Result<Option<WorkflowCheckpoint>, CheckpointError> {
        Ok(self.checkpoints.get(&instance_id).map(|c| c.value().clone()))
    }

    async fn delete(&self, instance_id: Uuid) -> Result<bool, CheckpointError> {
        Ok(self.checkpoints.remove(&instance_id).is_some())
    }

    async fn list(&self) -> Result<Vec<WorkflowCheckpoint>, CheckpointError> {
        let mut all: Vec<WorkflowCheckpoint> =
            self.checkpoints.iter().map(|c| c.value().clone()).collect();
        all.sort_by_key(|c| c.created_at);
        Ok(all)
    }
}
