//! Dispatcher: ties the registry, task store, assignment engine and worker
//! agent together
//!
//! Lock order is always placement pass, then task, then worker. Assignment
//! holds the task lock while it reserves a slot and commits
//! `pending -> assigned`; the RPC to the worker happens after every lock is
//! released, and its result is folded back in under the task lock again.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::agent::WorkerAgent;
use crate::config::Config;
use crate::model::{LoadReport, Task, TaskOptions, TaskPriority, TaskStatus, Worker};
use crate::observability::{Metrics, MetricsSnapshot};
use crate::registry::{Expiry, Registration, RegistryError, RegistrySettings, WorkerRegistry};
use crate::scheduler::{AssignError, Assigner, Strategy};
use crate::storage::Backend;
use crate::tasks::{Outcome, RetryPolicy, TaskError, TaskEvent, TaskStore};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// A task submission
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub url: String,
    #[serde(default)]
    pub options: TaskOptions,
    #[serde(default)]
    pub priority: TaskPriority,
}

/// Status a worker can report for one of its tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Downloading,
    Completed,
    Failed,
}

/// Progress or result pushed by a worker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskReport {
    /// Reporting worker; reports from anyone but the owner are stale
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub status: Option<ReportedStatus>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub download_speed: Option<u64>,
    #[serde(default)]
    pub engine_handle: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Failed reports are retried unless this is false
    #[serde(default)]
    pub retriable: Option<bool>,
}

/// Result of one scheduling pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleReport {
    pub assigned: usize,
    pub waiting: usize,
}

/// Fleet-wide picture served by the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct FleetSummary {
    pub strategy: Strategy,
    pub total_workers: usize,
    pub active_workers: usize,
    pub workers_by_status: BTreeMap<&'static str, usize>,
    pub total_tasks: usize,
    pub tasks_by_status: BTreeMap<&'static str, usize>,
    pub total_slots: u64,
    pub used_slots: u64,
    pub system_load: f64,
    pub metrics: MetricsSnapshot,
}

/// What removing a silent worker did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Removal {
    pub removed: bool,
    pub tasks_recycled: usize,
}

enum Placement {
    Assigned(Task, Worker),
    NoWorker,
    Skipped,
}

pub struct Dispatcher {
    backend: Arc<dyn Backend>,
    registry: Arc<WorkerRegistry>,
    tasks: Arc<TaskStore>,
    assigner: Assigner,
    agent: Arc<dyn WorkerAgent>,
    metrics: Arc<Metrics>,
    /// One placement pass at a time keeps round-robin order stable; taking a
    /// worker offline also waits on it
    scheduling: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        backend: Arc<dyn Backend>,
        agent: Arc<dyn WorkerAgent>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let registry = WorkerRegistry::new(backend.clone(), RegistrySettings::from(&config.workers));
        let tasks = TaskStore::new(backend.clone(), RetryPolicy::from(&config.assignment));

        Self {
            backend,
            registry: Arc::new(registry),
            tasks: Arc::new(tasks),
            assigner: Assigner::new(config.assignment.strategy),
            agent,
            metrics,
            scheduling: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn strategy(&self) -> Strategy {
        self.assigner.strategy()
    }

    /// Create a task and try to place it right away
    ///
    /// The returned record reflects the placement attempt; with no eligible
    /// worker it stays `pending` until a later pass.
    pub async fn create_task(&self, new_task: NewTask) -> Result<Task> {
        if new_task.url.trim().is_empty() {
            return Err(DispatchError::InvalidRequest("url is required".into()));
        }

        let task = self
            .tasks
            .create(new_task.url, new_task.options, new_task.priority)
            .await?;
        self.metrics.task_created();

        if let Err(e) = self.schedule_pending().await {
            warn!(task_id = %task.id, error = %e, "Scheduling after create failed");
        }

        Ok(self.tasks.get(&task.id).await?)
    }

    pub async fn schedule_pending(&self) -> Result<ScheduleReport> {
        self.schedule_pending_at(Utc::now()).await
    }

    /// Offer every schedulable pending task to the assignment engine
    ///
    /// Placement runs one pass at a time; the worker RPCs for the placed
    /// tasks run afterwards, concurrently and outside the pass lock.
    pub async fn schedule_pending_at(&self, now: DateTime<Utc>) -> Result<ScheduleReport> {
        let (placed, report) = self.place_pending(now).await?;
        if placed.is_empty() {
            return Ok(report);
        }

        let dispatches = placed
            .into_iter()
            .map(|(task, worker)| self.dispatch_to_worker(task, worker));
        for result in join_all(dispatches).await {
            result?;
        }
        Ok(report)
    }

    async fn place_pending(&self, now: DateTime<Utc>) -> Result<(Vec<(Task, Worker)>, ScheduleReport)> {
        let _pass = self.scheduling.lock().await;

        let queue = self.tasks.schedulable(now).await?;
        if queue.is_empty() {
            return Ok((Vec::new(), ScheduleReport::default()));
        }

        let mut snapshot = self.registry.snapshot().await?;
        let mut report = ScheduleReport::default();
        let mut placed = Vec::new();

        for (position, task) in queue.iter().enumerate() {
            match self.place(&task.id, &mut snapshot, now).await? {
                Placement::Assigned(task, worker) => {
                    report.assigned += 1;
                    placed.push((task, worker));
                }
                Placement::Skipped => {}
                Placement::NoWorker => {
                    // Eligibility does not depend on the task, so nothing
                    // behind this one can be placed either
                    report.waiting = queue.len() - position;
                    debug!(waiting = report.waiting, "No eligible worker, tasks stay pending");
                    break;
                }
            }
        }

        if report.assigned > 0 {
            info!(assigned = report.assigned, waiting = report.waiting, "Scheduling pass complete");
        }
        Ok((placed, report))
    }

    /// Reserve a slot and commit the assignment for one task
    async fn place(&self, task_id: &str, snapshot: &mut [Worker], now: DateTime<Utc>) -> Result<Placement> {
        let mut handle = match self.tasks.lock(task_id).await {
            Ok(handle) => handle,
            Err(TaskError::NotFound(_)) => return Ok(Placement::Skipped),
            Err(e) => return Err(e.into()),
        };
        if !handle.task().is_schedulable(now) {
            return Ok(Placement::Skipped);
        }

        let mut passed_over: HashSet<String> = HashSet::new();
        let worker = loop {
            let candidates: Vec<Worker> = snapshot
                .iter()
                .filter(|w| !passed_over.contains(&w.id))
                .cloned()
                .collect();
            let worker_id = match self.assigner.select(handle.task(), &candidates) {
                Ok(id) => id,
                Err(AssignError::NoEligibleWorker(_)) => return Ok(Placement::NoWorker),
            };

            match self.registry.reserve(&worker_id, task_id).await {
                Ok(worker) => {
                    self.assigner.advance();
                    refresh(snapshot, worker.clone());
                    break worker;
                }
                Err(
                    e @ (RegistryError::NoCapacity(_)
                    | RegistryError::Unavailable { .. }
                    | RegistryError::UnknownWorker(_)),
                ) => {
                    // The snapshot was stale; learn the truth and pick again
                    debug!(task_id, worker_id = %worker_id, error = %e, "Reservation refused");
                    if let Some(current) = self.registry.find(&worker_id).await? {
                        refresh(snapshot, current);
                    }
                    passed_over.insert(worker_id);
                }
                Err(e) => return Err(e.into()),
            }
        };

        let event = TaskEvent::Assign {
            worker_id: worker.id.clone(),
            engine_handle: None,
        };
        if let Err(e) = handle.apply(&event, now).await {
            self.registry.release(&worker.id, task_id).await?;
            return Err(e.into());
        }
        self.metrics.task_assigned();
        info!(
            task_id,
            worker_id = %worker.id,
            strategy = %self.assigner.strategy(),
            load = worker.load_percentage(),
            "Task assigned"
        );

        Ok(Placement::Assigned(handle.into_task(), worker))
    }

    /// Hand an assigned task to its worker and record the engine handle
    async fn dispatch_to_worker(&self, task: Task, worker: Worker) -> Result<()> {
        match self.agent.submit(&worker, &task).await {
            Ok(engine_handle) => {
                self.registry.record_rpc_success(&worker.id).await?;

                let mut handle = match self.tasks.lock(&task.id).await {
                    Ok(handle) => handle,
                    Err(TaskError::NotFound(_)) => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                match self
                    .tasks
                    .attach_engine_handle(&mut handle, &worker.id, &engine_handle, Utc::now())
                    .await
                {
                    Ok(Outcome::Stale) => {
                        // Cancelled or reclaimed while the call was in flight
                        drop(handle);
                        info!(task_id = %task.id, worker_id = %worker.id, %engine_handle, "Task moved on during dispatch, cancelling transfer");
                        self.cancel_on_worker(worker, engine_handle);
                    }
                    Ok(_) => {
                        debug!(task_id = %task.id, worker_id = %worker.id, %engine_handle, "Engine handle attached");
                    }
                    Err(e @ TaskError::DuplicateEngineHandle { .. }) => {
                        error!(task_id = %task.id, error = %e, "Worker returned a handle already in use");
                        drop(handle);
                        self.reclaim(&task.id, &worker.id, &e.to_string()).await?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => {
                warn!(task_id = %task.id, worker_id = %worker.id, error = %e, "Dispatch to worker failed");
                self.metrics.dispatch_failed();
                self.registry.record_rpc_failure(&worker.id).await?;
                self.reclaim(&task.id, &worker.id, &format!("dispatch failed: {e}"))
                    .await?;
            }
        }
        Ok(())
    }

    /// Cancel a task; the worker is told afterwards, best effort
    pub async fn cancel_task(&self, task_id: &str) -> Result<Task> {
        let mut handle = self.tasks.lock(task_id).await?;
        let before = handle.task().clone();
        let outcome = handle.apply(&TaskEvent::Cancel, Utc::now()).await?;
        self.settle(&before, handle.task(), outcome).await?;
        let task = handle.into_task();

        if let (Some(worker_id), Some(engine_handle)) = (&before.worker_id, &before.engine_handle) {
            if before.status.is_in_flight() {
                match self.registry.find(worker_id).await? {
                    Some(worker) => self.cancel_on_worker(worker, engine_handle.clone()),
                    None => debug!(task_id, worker_id = %worker_id, "Owner gone, skipping remote cancel"),
                }
            }
        }

        Ok(task)
    }

    fn cancel_on_worker(&self, worker: Worker, engine_handle: String) {
        let agent = self.agent.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let outcome = match agent.cancel(&worker, &engine_handle).await {
                Ok(()) => registry.record_rpc_success(&worker.id).await.map(|_| ()),
                Err(e) => {
                    warn!(worker_id = %worker.id, %engine_handle, error = %e, "Remote cancel failed");
                    registry.record_rpc_failure(&worker.id).await.map(|_| ())
                }
            };
            if let Err(e) = outcome {
                warn!(worker_id = %worker.id, error = %e, "Failed to record RPC outcome");
            }
        });
    }

    /// Apply a worker's progress or result report
    pub async fn report(&self, task_id: &str, report: TaskReport) -> Result<(Task, Outcome)> {
        let now = Utc::now();
        let mut handle = self.tasks.lock(task_id).await?;
        let before = handle.task().clone();

        let foreign = report
            .worker_id
            .as_deref()
            .is_some_and(|reporter| before.worker_id.as_deref() != Some(reporter));
        if before.status.is_terminal() || foreign {
            self.metrics.stale_update();
            debug!(
                task_id,
                status = %before.status,
                reporter = report.worker_id.as_deref().unwrap_or("-"),
                "Discarding stale report"
            );
            return Ok((before, Outcome::Stale));
        }

        let mut outcome = Outcome::Applied;
        if let (Some(engine_handle), Some(owner)) = (&report.engine_handle, &before.worker_id) {
            if before.engine_handle.as_ref() != Some(engine_handle) {
                outcome = self
                    .tasks
                    .attach_engine_handle(&mut handle, owner, engine_handle, now)
                    .await?;
            }
        }

        if let Some(event) = report_event(&report) {
            outcome = handle.apply(&event, now).await?;
        }

        self.settle(&before, handle.task(), outcome).await?;
        Ok((handle.into_task(), outcome))
    }

    /// Fail a task directly, e.g. on operator request
    pub async fn fail_task(&self, task_id: &str, reason: &str, retriable: bool) -> Result<(Task, Outcome)> {
        let mut handle = self.tasks.lock(task_id).await?;
        let before = handle.task().clone();
        let event = TaskEvent::Fail {
            reason: reason.to_string(),
            retriable,
        };
        let outcome = handle.apply(&event, Utc::now()).await?;
        self.settle(&before, handle.task(), outcome).await?;
        Ok((handle.into_task(), outcome))
    }

    /// Retriably fail `task_id` if it is still running on `worker_id`
    ///
    /// Returns `None` when the task already moved on, which makes repeated
    /// sweeps harmless.
    pub async fn reclaim(&self, task_id: &str, worker_id: &str, reason: &str) -> Result<Option<(Task, Outcome)>> {
        self.reclaim_at(task_id, worker_id, reason, Utc::now()).await
    }

    pub async fn reclaim_at(
        &self,
        task_id: &str,
        worker_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(Task, Outcome)>> {
        let mut handle = match self.tasks.lock(task_id).await {
            Ok(handle) => handle,
            Err(TaskError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !owned_by(handle.task(), worker_id) {
            return Ok(None);
        }

        let before = handle.task().clone();
        let event = TaskEvent::Fail {
            reason: reason.to_string(),
            retriable: true,
        };
        let outcome = handle.apply(&event, now).await?;
        self.settle(&before, handle.task(), outcome).await?;

        let task = handle.into_task();
        info!(
            task_id,
            worker_id,
            reason,
            retries = task.retries,
            status = %task.status,
            "Task reclaimed from worker"
        );
        Ok(Some((task, outcome)))
    }

    /// Drop slot bookings whose task no longer runs on that worker
    pub async fn reconcile_slots(&self) -> Result<usize> {
        let mut released = 0;
        for worker in self.registry.snapshot().await? {
            for task_id in &worker.current_tasks {
                // Task lock first so an assignment in progress is not undone
                let handle = match self.tasks.lock(task_id).await {
                    Ok(handle) => Some(handle),
                    Err(TaskError::NotFound(_)) => None,
                    Err(e) => return Err(e.into()),
                };
                let holds = handle
                    .as_ref()
                    .is_some_and(|h| owned_by(h.task(), &worker.id));
                if !holds && self.registry.release(&worker.id, task_id).await? {
                    warn!(worker_id = %worker.id, task_id = %task_id, "Released orphaned slot");
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    pub async fn register_worker(&self, registration: Registration) -> Result<Worker> {
        let worker = self.registry.register(registration, Utc::now()).await?;
        if let Err(e) = self.schedule_pending().await {
            warn!(worker_id = %worker.id, error = %e, "Scheduling after registration failed");
        }
        Ok(self.registry.get(&worker.id).await?)
    }

    pub async fn heartbeat(&self, worker_id: &str, report: LoadReport) -> Result<Worker> {
        Ok(self.registry.heartbeat(worker_id, report, Utc::now()).await?)
    }

    /// Take a worker out of the fleet, recycling everything it was running
    pub async fn remove_worker(&self, worker_id: &str, reason: &str) -> Result<usize> {
        self.remove_worker_at(worker_id, reason, Utc::now()).await
    }

    pub async fn remove_worker_at(&self, worker_id: &str, reason: &str, now: DateTime<Utc>) -> Result<usize> {
        // Offline first so nothing new lands on it while we drain
        {
            let _pass = self.scheduling.lock().await;
            self.registry.mark_offline(worker_id).await?;
        }

        let mut recycled = 0;
        for task in self.tasks.in_flight_on(worker_id).await? {
            if self.reclaim_at(&task.id, worker_id, reason, now).await?.is_some() {
                recycled += 1;
            }
        }

        if self.registry.remove(worker_id).await? {
            self.metrics.worker_removed();
        }
        Ok(recycled)
    }

    /// Mark a worker offline if it is silent past `timeout`
    ///
    /// Waits for any placement pass in progress, so every assignment to the
    /// worker is either committed before the mark or refused after it.
    pub async fn expire_worker_at(
        &self,
        worker_id: &str,
        timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Expiry> {
        let _pass = self.scheduling.lock().await;
        Ok(self.registry.expire(worker_id, now, timeout).await?)
    }

    /// Remove a worker that has been silent past `threshold`, re-checked
    /// under its lock at each step so a returning worker is spared
    pub async fn remove_silent_worker_at(
        &self,
        worker_id: &str,
        threshold: chrono::Duration,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Removal> {
        let mut removal = Removal::default();
        if !self.expire_worker_at(worker_id, threshold, now).await?.is_expired() {
            return Ok(removal);
        }

        for task in self.tasks.in_flight_on(worker_id).await? {
            if self.reclaim_at(&task.id, worker_id, reason, now).await?.is_some() {
                removal.tasks_recycled += 1;
            }
        }

        if self.registry.remove_if_silent(worker_id, now, threshold).await? {
            self.metrics.worker_removed();
            removal.removed = true;
        }
        Ok(removal)
    }

    pub async fn summary(&self) -> Result<FleetSummary> {
        let workers = self.registry.snapshot().await?;
        let tasks_by_status = self.tasks.counts().await?;
        let workers_by_status = self.registry.counts().await?;

        let active: Vec<&Worker> = workers.iter().filter(|w| w.status.is_active()).collect();
        let total_slots: u64 = active.iter().map(|w| u64::from(w.total_slots)).sum();
        let used_slots: u64 = active.iter().map(|w| u64::from(w.used_slots)).sum();
        let system_load = if total_slots == 0 {
            0.0
        } else {
            used_slots as f64 / total_slots as f64 * 100.0
        };

        Ok(FleetSummary {
            strategy: self.assigner.strategy(),
            total_workers: workers.len(),
            active_workers: active.len(),
            workers_by_status,
            total_tasks: tasks_by_status.values().sum(),
            tasks_by_status,
            total_slots,
            used_slots,
            system_load,
            metrics: self.metrics.snapshot(),
        })
    }

    /// Bookkeeping after a transition: slot release and counters
    async fn settle(&self, before: &Task, after: &Task, outcome: Outcome) -> Result<()> {
        match outcome {
            Outcome::Stale => self.metrics.stale_update(),
            Outcome::Recycled => self.metrics.task_recycled(),
            Outcome::Applied if before.status != after.status => match after.status {
                TaskStatus::Completed => self.metrics.task_completed(),
                TaskStatus::Failed => self.metrics.task_failed(),
                TaskStatus::Cancelled => self.metrics.task_cancelled(),
                _ => {}
            },
            Outcome::Applied => {}
        }

        if let Some(worker_id) = before.worker_id.as_deref() {
            if before.status.is_in_flight() && !owned_by(after, worker_id) {
                self.registry.release(worker_id, &after.id).await?;
            }
        }
        Ok(())
    }
}

/// In flight on exactly this worker
fn owned_by(task: &Task, worker_id: &str) -> bool {
    task.status.is_in_flight() && task.worker_id.as_deref() == Some(worker_id)
}

fn refresh(snapshot: &mut [Worker], worker: Worker) {
    if let Some(slot) = snapshot.iter_mut().find(|w| w.id == worker.id) {
        *slot = worker;
    }
}

fn report_event(report: &TaskReport) -> Option<TaskEvent> {
    match report.status {
        Some(ReportedStatus::Completed) => Some(TaskEvent::Complete {
            result: report.result.clone(),
        }),
        Some(ReportedStatus::Failed) => Some(TaskEvent::Fail {
            reason: report
                .error_message
                .clone()
                .unwrap_or_else(|| "download failed".to_string()),
            retriable: report.retriable.unwrap_or(true),
        }),
        Some(ReportedStatus::Downloading) => Some(TaskEvent::Progress {
            progress: report.progress.unwrap_or(0.0),
            download_speed: report.download_speed,
        }),
        None if report.progress.is_some() || report.download_speed.is_some() => {
            Some(TaskEvent::Progress {
                progress: report.progress.unwrap_or(0.0),
                download_speed: report.download_speed,
            })
        }
        None => None,
    }
}
