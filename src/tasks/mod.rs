//! Task store
//!
//! Owns every task record. All mutations go through a per-task lock, load
//! the current record, run it through [`state::transition`] and save the
//! result, so a progress report racing with a cancel can never resurrect a
//! terminal task.

pub mod state;

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::locks::{KeyGuard, KeyedLocks};
use crate::model::{Task, TaskOptions, TaskPriority, TaskStatus};
use crate::storage::{Backend, StorageError};

pub use state::{Outcome, RetryPolicy, TaskEvent, TransitionError};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("engine handle {engine_handle} on worker {worker_id} is already bound to task {other_task}")]
    DuplicateEngineHandle {
        worker_id: String,
        engine_handle: String,
        other_task: String,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, TaskError>;

pub struct TaskStore {
    backend: Arc<dyn Backend>,
    locks: KeyedLocks,
    policy: RetryPolicy,
    /// Serializes engine-handle binding so the uniqueness scan cannot race
    handles: Mutex<()>,
}

/// A task record held under its lock
///
/// Dropping the handle releases the lock.
pub struct TaskHandle<'a> {
    store: &'a TaskStore,
    task: Task,
    _guard: KeyGuard,
}

impl TaskHandle<'_> {
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn into_task(self) -> Task {
        self.task
    }

    /// Run `event` against the locked record and persist any change
    pub async fn apply(&mut self, event: &TaskEvent, now: DateTime<Utc>) -> Result<Outcome> {
        let mut next = self.task.clone();
        let outcome = state::transition(&mut next, event, now, &self.store.policy)?;

        if outcome == Outcome::Stale {
            debug!(task_id = %next.id, event = event.name(), status = %next.status, "Ignoring stale update");
            return Ok(outcome);
        }

        self.store.backend.save_task(&next).await?;
        if next.status != self.task.status {
            info!(
                task_id = %next.id,
                from = %self.task.status,
                to = %next.status,
                worker_id = next.worker_id.as_deref().unwrap_or("-"),
                "Task transitioned"
            );
        }
        self.task = next;
        Ok(outcome)
    }
}

impl TaskStore {
    pub fn new(backend: Arc<dyn Backend>, policy: RetryPolicy) -> Self {
        Self {
            backend,
            locks: KeyedLocks::new(),
            policy,
            handles: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Create a new task in `pending`
    pub async fn create(
        &self,
        url: impl Into<String>,
        options: TaskOptions,
        priority: TaskPriority,
    ) -> Result<Task> {
        let task = Task::new(url, options, priority);
        self.backend.save_task(&task).await?;
        info!(task_id = %task.id, url = %task.url, priority = ?task.priority, "Task created");
        Ok(task)
    }

    pub async fn find(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.backend.load_task(id).await?)
    }

    pub async fn get(&self, id: &str) -> Result<Task> {
        self.find(id)
            .await?
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    /// All tasks, oldest first
    pub async fn list(&self) -> Result<Vec<Task>> {
        let mut tasks = self.backend.list_tasks().await?;
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    pub async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let mut tasks = self.list().await?;
        tasks.retain(|task| task.status == status);
        Ok(tasks)
    }

    /// Task count per status, every status present
    pub async fn counts(&self) -> Result<BTreeMap<&'static str, usize>> {
        let mut counts: BTreeMap<&'static str, usize> =
            TaskStatus::ALL.iter().map(|s| (s.as_str(), 0)).collect();
        for task in self.backend.list_tasks().await? {
            *counts.entry(task.status.as_str()).or_default() += 1;
        }
        Ok(counts)
    }

    /// Pending tasks whose retry delay has elapsed, highest priority first,
    /// then oldest first
    pub async fn schedulable(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .backend
            .list_tasks()
            .await?
            .into_iter()
            .filter(|task| task.is_schedulable(now))
            .collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(tasks)
    }

    /// Tasks currently occupying a slot on `worker_id`
    pub async fn in_flight_on(&self, worker_id: &str) -> Result<Vec<Task>> {
        let mut tasks = self.list().await?;
        tasks.retain(|task| {
            task.status.is_in_flight() && task.worker_id.as_deref() == Some(worker_id)
        });
        Ok(tasks)
    }

    /// Take the task's lock and load its current record
    pub async fn lock(&self, id: &str) -> Result<TaskHandle<'_>> {
        let guard = self.locks.lock(id).await;
        let task = self.get(id).await?;
        Ok(TaskHandle {
            store: self,
            task,
            _guard: guard,
        })
    }

    /// Lock, transition, save, release
    pub async fn apply(&self, id: &str, event: &TaskEvent, now: DateTime<Utc>) -> Result<(Task, Outcome)> {
        let mut handle = self.lock(id).await?;
        let outcome = handle.apply(event, now).await?;
        Ok((handle.into_task(), outcome))
    }

    pub async fn assign(&self, id: &str, worker_id: &str, engine_handle: Option<String>) -> Result<Task> {
        let event = TaskEvent::Assign {
            worker_id: worker_id.to_string(),
            engine_handle,
        };
        Ok(self.apply(id, &event, Utc::now()).await?.0)
    }

    /// Progress for a terminal task comes back as [`Outcome::Stale`]
    pub async fn update_progress(
        &self,
        id: &str,
        progress: f64,
        download_speed: Option<u64>,
    ) -> Result<(Task, Outcome)> {
        let event = TaskEvent::Progress {
            progress,
            download_speed,
        };
        self.apply(id, &event, Utc::now()).await
    }

    pub async fn complete(&self, id: &str, result: Option<Value>) -> Result<Task> {
        Ok(self.apply(id, &TaskEvent::Complete { result }, Utc::now()).await?.0)
    }

    pub async fn fail(&self, id: &str, reason: &str, retriable: bool) -> Result<(Task, Outcome)> {
        let event = TaskEvent::Fail {
            reason: reason.to_string(),
            retriable,
        };
        self.apply(id, &event, Utc::now()).await
    }

    pub async fn cancel(&self, id: &str) -> Result<Task> {
        Ok(self.apply(id, &TaskEvent::Cancel, Utc::now()).await?.0)
    }

    /// Bind an engine handle to an in-flight task owned by `worker_id`
    ///
    /// Fails if another live task on the same worker already holds the handle.
    pub async fn attach_engine_handle(
        &self,
        handle: &mut TaskHandle<'_>,
        worker_id: &str,
        engine_handle: &str,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let _serial = self.handles.lock().await;

        if let Some(other) = self
            .backend
            .list_tasks()
            .await?
            .into_iter()
            .find(|other| {
                other.id != handle.task().id
                    && !other.status.is_terminal()
                    && other.worker_id.as_deref() == Some(worker_id)
                    && other.engine_handle.as_deref() == Some(engine_handle)
            })
        {
            return Err(TaskError::DuplicateEngineHandle {
                worker_id: worker_id.to_string(),
                engine_handle: engine_handle.to_string(),
                other_task: other.id,
            });
        }

        let event = TaskEvent::AttachHandle {
            worker_id: worker_id.to_string(),
            engine_handle: engine_handle.to_string(),
        };
        handle.apply(&event, now).await
    }
}
