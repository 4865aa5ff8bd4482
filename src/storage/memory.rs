use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::{Backend, Result};
use crate::config::StorageBackendKind;
use crate::model::{Task, Worker};

/// Volatile backend: records live only as long as the process
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tasks: RwLock<HashMap<String, Task>>,
    workers: RwLock<HashMap<String, Worker>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn save_task(&self, task: &Task) -> Result<()> {
        self.tasks.write().await.insert(task.id.clone(), task.clone());
        debug!(task_id = %task.id, "Saved task");
        Ok(())
    }

    async fn load_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.tasks.read().await.values().cloned().collect())
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        Ok(self.tasks.write().await.remove(id).is_some())
    }

    async fn save_worker(&self, worker: &Worker) -> Result<()> {
        self.workers
            .write()
            .await
            .insert(worker.id.clone(), worker.clone());
        debug!(worker_id = %worker.id, "Saved worker");
        Ok(())
    }

    async fn load_worker(&self, id: &str) -> Result<Option<Worker>> {
        Ok(self.workers.read().await.get(id).cloned())
    }

    async fn list_workers(&self) -> Result<Vec<Worker>> {
        Ok(self.workers.read().await.values().cloned().collect())
    }

    async fn delete_worker(&self, id: &str) -> Result<bool> {
        Ok(self.workers.write().await.remove(id).is_some())
    }

    fn kind(&self) -> StorageBackendKind {
        StorageBackendKind::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskOptions, TaskPriority};

    #[tokio::test]
    async fn test_save_and_load_task() {
        let backend = MemoryBackend::new();
        let task = Task::new("https://example.com/file", TaskOptions::new(), TaskPriority::Normal);

        backend.save_task(&task).await.unwrap();
        let loaded = backend.load_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded, task);

        assert!(backend.load_task("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_task_reports_presence() {
        let backend = MemoryBackend::new();
        let task = Task::new("https://example.com/file", TaskOptions::new(), TaskPriority::Normal);
        backend.save_task(&task).await.unwrap();

        assert!(backend.delete_task(&task.id).await.unwrap());
        assert!(!backend.delete_task(&task.id).await.unwrap());
        assert!(backend.list_tasks().await.unwrap().is_empty());
    }
}
