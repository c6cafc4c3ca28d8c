//! Durable checkpoint store: one JSON document per instance.
//!
//! Each checkpoint lives at `{dir}/{instance_id}.json`. Saves write a uniquely
//! named temporary sibling and rename it over the target, so readers never
//! observe a partially written document. Writes for one instance are
//! serialized through a per-instance async mutex.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use nodeflow_core::workflow::checkpoint::{CheckpointError, CheckpointStore};
use nodeflow_types::checkpoint::WorkflowCheckpoint;
use tokio::sync::Mutex;
use uuid::Uuid;

const EXTENSION: &str = "json";

/// File-per-instance implementation of [`CheckpointStore`].
pub struct FileCheckpointStore {
    dir: PathBuf,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl FileCheckpointStore {
    /// Open (creating if needed) a checkpoint directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        tracing::debug!(dir = %dir.display(), "checkpoint directory ready");
        Ok(Self {
            dir,
            locks: DashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, instance_id: Uuid) -> PathBuf {
        self.dir.join(format!("{instance_id}.{EXTENSION}"))
    }

    fn lock_for(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(instance_id).or_default().value())
    }

    async fn read(&self, instance_id: Uuid) -> Result<Option<WorkflowCheckpoint>, CheckpointError> {
        let bytes = match tokio::fs::read(self.path_for(instance_id)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| CheckpointError::Corrupted {
                instance_id,
                reason: err.to_string(),
            })
    }
}

impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), CheckpointError> {
        let instance_id = checkpoint.instance_id;
        let bytes = serde_json::to_vec_pretty(checkpoint)?;

        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let target = self.path_for(instance_id);
        let tmp = self
            .dir
            .join(format!("{instance_id}.{}.tmp", Uuid::now_v7().simple()));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }

        tracing::debug!(
            %instance_id,
            status = %checkpoint.status,
            bytes = bytes.len(),
            "checkpoint written"
        );
        Ok(())
    }

    async fn load(&self, instance_id: Uuid) -> Result<Option<WorkflowCheckpoint>, CheckpointError> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;
        self.read(instance_id).await
    }

    async fn delete(&self, instance_id: Uuid) -> Result<bool, CheckpointError> {
        let lock = self.lock_for(instance_id);
        let removed = {
            let _guard = lock.lock().await;
            match tokio::fs::remove_file(self.path_for(instance_id)).await {
                Ok(()) => true,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
                Err(err) => return Err(err.into()),
            }
        };
        self.locks.remove(&instance_id);
        tracing::debug!(%instance_id, removed, "checkpoint deleted");
        Ok(removed)
    }

    /// Every readable checkpoint, oldest first. Temporary files are ignored;
    /// corrupt documents are logged and skipped.
    async fn list(&self) -> Result<Vec<WorkflowCheckpoint>, CheckpointError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut checkpoints = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(instance_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };

            match self.load(instance_id).await {
                Ok(Some(checkpoint)) => checkpoints.push(checkpoint),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable checkpoint");
                }
            }
        }

        checkpoints.sort_by_key(|c| c.created_at);
        Ok(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use chrono::Utc;
    use nodeflow_core::node::NodeRegistry;
    use nodeflow_core::workflow::engine::WorkflowEngine;
    use nodeflow_types::config::EngineConfig;
    use nodeflow_types::definition::{NodeDefinition, WorkflowDefinition};
    use nodeflow_types::status::WorkflowStatus;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_checkpoint(status: WorkflowStatus) -> WorkflowCheckpoint {
        let definition = WorkflowDefinition::new("orders", "Orders")
            .with_node(NodeDefinition::new("a", "passthrough"));
        WorkflowCheckpoint {
            instance_id: Uuid::now_v7(),
            workflow_id: definition.id.clone(),
            definition,
            status,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            variables: HashMap::from([("total".to_string(), json!(42))]),
            node_states: HashMap::new(),
            node_instances: Vec::new(),
            pending_messages: HashMap::new(),
            completion_order: Vec::new(),
            compensations: Vec::new(),
            epoch_counter: 3,
            run_duration_ms: 120,
            error: None,
            failed_node_id: None,
        }
    }

    fn file_names(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn save_load_delete_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(tmp.path().join("cp")).await.unwrap();
        let cp = sample_checkpoint(WorkflowStatus::Paused);

        store.save(&cp).await.unwrap();
        let loaded = store.load(cp.instance_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Paused);
        assert_eq!(loaded.variables, cp.variables);
        assert_eq!(loaded.epoch_counter, 3);
        assert_eq!(file_names(store.dir()), vec![format!("{}.json", cp.instance_id)]);

        assert!(store.delete(cp.instance_id).await.unwrap());
        assert!(!store.delete(cp.instance_id).await.unwrap());
        assert!(store.load(cp.instance_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported_on_load_and_skipped_on_list() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(tmp.path()).await.unwrap();
        let good = sample_checkpoint(WorkflowStatus::Running);
        store.save(&good).await.unwrap();

        let broken = Uuid::now_v7();
        tokio::fs::write(tmp.path().join(format!("{broken}.json")), "{ not json")
            .await
            .unwrap();
        tokio::fs::write(tmp.path().join(format!("{broken}.abc.tmp")), "partial")
            .await
            .unwrap();
        tokio::fs::write(tmp.path().join("notes.json"), "{}").await.unwrap();

        assert!(matches!(
            store.load(broken).await,
            Err(CheckpointError::Corrupted { instance_id, .. }) if instance_id == broken
        ));
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].instance_id, good.instance_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_saves_leave_one_complete_document() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FileCheckpointStore::open(tmp.path()).await.unwrap());
        let cp = sample_checkpoint(WorkflowStatus::Running);

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            let mut cp = cp.clone();
            handles.push(tokio::spawn(async move {
                cp.variables.insert("i".into(), json!(i));
                store.save(&cp).await.unwrap();
                let loaded = store.load(cp.instance_id).await.unwrap().unwrap();
                assert!(loaded.variables.contains_key("i"));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(file_names(tmp.path()).len(), 1);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn engine_recovers_paused_instance_from_disk() {
        let tmp = TempDir::new().unwrap();
        let def = WorkflowDefinition::new("durable", "Durable")
            .with_node(NodeDefinition::new("wait", "delay").with_config(json!({ "delay_ms": 150 })))
            .with_node(NodeDefinition::new("finish", "passthrough"))
            .connect("wait", "finish");

        let first = WorkflowEngine::with_checkpoint_store(
            NodeRegistry::with_builtins(),
            EngineConfig::default(),
            FileCheckpointStore::open(tmp.path()).await.unwrap(),
        );
        let id = first.start(def, json!({ "order": 1 })).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        first.pause(id).await.unwrap();
        assert_eq!(first.status(id).unwrap(), WorkflowStatus::Paused);

        let second = WorkflowEngine::with_checkpoint_store(
            NodeRegistry::with_builtins(),
            EngineConfig::default(),
            FileCheckpointStore::open(tmp.path()).await.unwrap(),
        );
        assert_eq!(second.recover_incomplete_workflows().await.unwrap(), vec![id]);
        let result = second.wait(id).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.completed_nodes, vec!["wait", "finish"]);
        let finish = result
            .node_instances
            .iter()
            .find(|i| i.node_id == "finish")
            .unwrap();
        assert_eq!(finish.output, Some(json!({ "order": 1 })));
    }
}
