//! Copy every record from one backend into another.

use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, warn};

use super::{Backend, Result};

/// Counts reported after a migration run
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStats {
    pub workers_migrated: usize,
    pub tasks_migrated: usize,
    /// Tasks whose `worker_id` names a worker absent from the source
    pub dangling_worker_refs: usize,
    pub errors: usize,
}

/// Write every worker, then every task, from `source` into `target` unchanged
///
/// Records keep their ids, so `task.worker_id` still resolves in the target.
/// Read failures abort the run; individual write failures are counted and
/// logged so one bad record does not block the rest.
pub async fn migrate(source: &dyn Backend, target: &dyn Backend) -> Result<MigrationStats> {
    let mut stats = MigrationStats::default();

    info!(source = ?source.kind(), target = ?target.kind(), "Migrating workers");
    let workers = source.list_workers().await?;
    let mut known_workers = HashSet::with_capacity(workers.len());

    for worker in &workers {
        match target.save_worker(worker).await {
            Ok(()) => {
                known_workers.insert(worker.id.clone());
                stats.workers_migrated += 1;
            }
            Err(e) => {
                warn!(worker_id = %worker.id, error = %e, "Failed to migrate worker");
                stats.errors += 1;
            }
        }
    }

    info!("Migrating tasks");
    for task in source.list_tasks().await? {
        if let Some(worker_id) = &task.worker_id {
            if !known_workers.contains(worker_id) {
                warn!(task_id = %task.id, worker_id = %worker_id, "Task references unknown worker");
                stats.dangling_worker_refs += 1;
            }
        }

        match target.save_task(&task).await {
            Ok(()) => stats.tasks_migrated += 1,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to migrate task");
                stats.errors += 1;
            }
        }
    }

    target.flush().await?;

    info!(
        workers = stats.workers_migrated,
        tasks = stats.tasks_migrated,
        errors = stats.errors,
        "Migration completed"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Task, TaskOptions, TaskPriority};
    use crate::storage::{FjallBackend, MemoryBackend};

    #[tokio::test]
    async fn test_migrate_counts_dangling_references() {
        let source = MemoryBackend::new();
        let target = MemoryBackend::new();

        let mut task = Task::new("https://example.com/x", TaskOptions::new(), TaskPriority::Normal);
        task.worker_id = Some("worker-gone".into());
        source.save_task(&task).await.unwrap();

        let stats = migrate(&source, &target).await.unwrap();
        assert_eq!(stats.tasks_migrated, 1);
        assert_eq!(stats.workers_migrated, 0);
        assert_eq!(stats.dangling_worker_refs, 1);
        assert_eq!(target.load_task(&task.id).await.unwrap(), Some(task));
    }

    #[tokio::test]
    async fn test_migrated_records_survive_reopen() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("target");
        let source = MemoryBackend::new();
        let task = Task::new("https://example.com/y", TaskOptions::new(), TaskPriority::High);
        source.save_task(&task).await.unwrap();

        {
            let target = FjallBackend::open(&path).unwrap();
            migrate(&source, &target).await.unwrap();
        }

        let reopened = FjallBackend::open(&path).unwrap();
        assert_eq!(reopened.load_task(&task.id).await.unwrap(), Some(task));
    }

    #[tokio::test]
    async fn test_migrate_empty_source() {
        let stats = migrate(&MemoryBackend::new(), &MemoryBackend::new()).await.unwrap();
        assert_eq!(stats, MigrationStats::default());
    }
}
