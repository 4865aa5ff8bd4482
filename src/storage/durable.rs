use std::path::Path;

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use tracing::{debug, info};

use super::keys::{
    decode_task_key, decode_worker_key, encode_meta_key, encode_task_key, encode_worker_key,
};
use super::{Backend, Result, StorageError};
use crate::config::StorageBackendKind;
use crate::model::{Task, Worker};

/// Bumped whenever the stored JSON layout changes incompatibly
const SCHEMA_VERSION: &str = "1";

/// Fjall-backed durable storage for task and worker records
///
/// Nested fields (options, capabilities, current task sets) are stored
/// losslessly as JSON documents, one per record.
#[derive(Clone)]
pub struct FjallBackend {
    keyspace: Keyspace,
    tasks: PartitionHandle,
    workers: PartitionHandle,
    metadata: PartitionHandle,
}

impl FjallBackend {
    /// Open or create a Fjall store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening Fjall store at: {}", path.display());

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;

        let tasks = keyspace.open_partition("tasks", PartitionCreateOptions::default())?;
        let workers = keyspace.open_partition("workers", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        metadata.insert(encode_meta_key("schema_version"), SCHEMA_VERSION.as_bytes())?;

        info!("Fjall store opened successfully");
        Ok(Self {
            keyspace,
            tasks,
            workers,
            metadata,
        })
    }

    /// Stored schema version, if the store has ever been opened
    pub fn schema_version(&self) -> Result<Option<String>> {
        Ok(self
            .metadata
            .get(encode_meta_key("schema_version"))?
            .map(|value| String::from_utf8_lossy(&value).to_string()))
    }
}

#[async_trait]
impl Backend for FjallBackend {
    async fn save_task(&self, task: &Task) -> Result<()> {
        let value = serde_json::to_vec(task)?;
        self.tasks.insert(encode_task_key(&task.id), value)?;
        debug!(task_id = %task.id, "Saved task");
        Ok(())
    }

    async fn load_task(&self, id: &str) -> Result<Option<Task>> {
        match self.tasks.get(encode_task_key(id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for item in self.tasks.iter() {
            let (key, value) = item?;
            if decode_task_key(&key).is_none() {
                return Err(StorageError::InvalidKey(
                    String::from_utf8_lossy(&key).to_string(),
                ));
            }
            tasks.push(serde_json::from_slice(&value)?);
        }
        Ok(tasks)
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        let key = encode_task_key(id);
        if !self.tasks.contains_key(&key)? {
            return Ok(false);
        }
        self.tasks.remove(key)?;
        Ok(true)
    }

    async fn save_worker(&self, worker: &Worker) -> Result<()> {
        let value = serde_json::to_vec(worker)?;
        self.workers.insert(encode_worker_key(&worker.id), value)?;
        debug!(worker_id = %worker.id, "Saved worker");
        Ok(())
    }

    async fn load_worker(&self, id: &str) -> Result<Option<Worker>> {
        match self.workers.get(encode_worker_key(id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    async fn list_workers(&self) -> Result<Vec<Worker>> {
        let mut workers = Vec::new();
        for item in self.workers.iter() {
            let (key, value) = item?;
            if decode_worker_key(&key).is_none() {
                return Err(StorageError::InvalidKey(
                    String::from_utf8_lossy(&key).to_string(),
                ));
            }
            workers.push(serde_json::from_slice(&value)?);
        }
        Ok(workers)
    }

    async fn delete_worker(&self, id: &str) -> Result<bool> {
        let key = encode_worker_key(id);
        if !self.workers.contains_key(&key)? {
            return Ok(false);
        }
        self.workers.remove(key)?;
        Ok(true)
    }

    async fn flush(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let _ = self.metadata.get(encode_meta_key("schema_version"))?;
        Ok(())
    }

    fn kind(&self) -> StorageBackendKind {
        StorageBackendKind::Fjall
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Capabilities, TaskOptions, TaskPriority, TaskStatus, WorkerStatus};
    use serde_json::json;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn create_test_backend() -> (FjallBackend, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let backend = FjallBackend::open(temp_dir.path().join("test_store")).unwrap();
        (backend, temp_dir)
    }

    fn create_test_worker(id: &str) -> Worker {
        let mut capabilities = Capabilities::default();
        capabilities.tags.insert("content_type".into(), "video".into());
        Worker {
            id: id.to_string(),
            hostname: "node-1".to_string(),
            address: "10.0.0.5".to_string(),
            port: 6800,
            capabilities,
            status: WorkerStatus::Online,
            total_slots: 4,
            used_slots: 1,
            current_tasks: BTreeSet::from(["task-1".to_string()]),
            connected_at: Some(chrono::Utc::now()),
            last_heartbeat: Some(chrono::Utc::now()),
            health_metrics: None,
            reported_slots: Some(1),
            rpc_failures: 0,
        }
    }

    #[tokio::test]
    async fn test_task_round_trip_is_lossless() {
        let (backend, _temp) = create_test_backend();
        let mut options = TaskOptions::new();
        options.insert("tags".into(), json!({"content_type": "video"}));
        options.insert("max-connection-per-server".into(), json!(16));
        let mut task = Task::new("https://example.com/a.mkv", options, TaskPriority::High);
        task.status = TaskStatus::Downloading;
        task.worker_id = Some("worker-1".into());
        task.engine_handle = Some("2089b05ecca3d829".into());
        task.result = Some(json!({"files": [{"path": "/downloads/a.mkv"}]}));

        backend.save_task(&task).await.unwrap();
        let loaded = backend.load_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded, task);
    }

    #[tokio::test]
    async fn test_worker_round_trip_and_list() {
        let (backend, _temp) = create_test_backend();
        let worker = create_test_worker("worker-a");
        backend.save_worker(&worker).await.unwrap();
        backend.save_worker(&create_test_worker("worker-b")).await.unwrap();

        let loaded = backend.load_worker("worker-a").await.unwrap().unwrap();
        assert_eq!(loaded, worker);

        let workers = backend.list_workers().await.unwrap();
        assert_eq!(workers.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_worker() {
        let (backend, _temp) = create_test_backend();
        backend.save_worker(&create_test_worker("worker-a")).await.unwrap();

        assert!(backend.delete_worker("worker-a").await.unwrap());
        assert!(!backend.delete_worker("worker-a").await.unwrap());
        assert!(backend.load_worker("worker-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persistence_across_reopens() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store");
        let task = Task::new("https://example.com/iso", TaskOptions::new(), TaskPriority::Normal);

        {
            let backend = FjallBackend::open(&path).unwrap();
            backend.save_task(&task).await.unwrap();
            backend.flush().await.unwrap();
        }

        let backend = FjallBackend::open(&path).unwrap();
        assert_eq!(backend.load_task(&task.id).await.unwrap(), Some(task));
        assert_eq!(backend.schema_version().unwrap().as_deref(), Some(SCHEMA_VERSION));
    }
}
