//! Worker registry
//!
//! Tracks the fleet: identity, capacity, tags and liveness. Every mutation of
//! a worker record happens under that worker's lock, which is also where slot
//! reservation re-checks capacity, so two assignments can never both take the
//! last free slot and `used_slots` always equals `current_tasks.len()`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WorkerManagementConfig;
use crate::locks::KeyedLocks;
use crate::model::{Capabilities, LoadReport, Worker, WorkerStatus};
use crate::storage::{Backend, StorageError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("worker {0} has no free slot")]
    NoCapacity(String),

    #[error("worker {worker_id} is {status}")]
    Unavailable {
        worker_id: String,
        status: WorkerStatus,
    },

    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Result of an offline check made under the worker lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Heard from within the timeout; left untouched
    Fresh,
    MarkedOffline,
    AlreadyOffline,
    /// No record any more
    Gone,
}

impl Expiry {
    /// The worker is silent past the timeout, so its tasks are fair game
    pub fn is_expired(&self) -> bool {
        matches!(self, Expiry::MarkedOffline | Expiry::AlreadyOffline)
    }
}

/// What a worker sends when it joins the fleet
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registration {
    /// Known id when re-registering; omitted on first contact
    #[serde(default)]
    pub id: Option<String>,
    pub hostname: String,
    /// RPC address; defaults to the hostname
    #[serde(default)]
    pub address: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub total_slots: Option<u32>,
}

/// Capacity policy the registry enforces
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    pub busy_threshold_percent: u8,
    pub rpc_failure_threshold: u32,
    pub default_total_slots: u32,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from(&WorkerManagementConfig::default())
    }
}

impl From<&WorkerManagementConfig> for RegistrySettings {
    fn from(config: &WorkerManagementConfig) -> Self {
        Self {
            busy_threshold_percent: config.busy_threshold_percent,
            rpc_failure_threshold: config.rpc_failure_threshold,
            default_total_slots: config.default_total_slots,
        }
    }
}

pub struct WorkerRegistry {
    backend: Arc<dyn Backend>,
    locks: KeyedLocks,
    /// Serializes registrations so one endpoint never gets two ids
    registrations: Mutex<()>,
    settings: RegistrySettings,
}

impl WorkerRegistry {
    pub fn new(backend: Arc<dyn Backend>, settings: RegistrySettings) -> Self {
        Self {
            backend,
            locks: KeyedLocks::new(),
            registrations: Mutex::new(()),
            settings,
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Idempotent upsert keyed by id, or by `hostname:port` when no id is given
    ///
    /// Returns the canonical worker record.
    pub async fn register(&self, registration: Registration, now: DateTime<Utc>) -> Result<Worker> {
        if registration.hostname.trim().is_empty() {
            return Err(RegistryError::InvalidRegistration("hostname is required".into()));
        }
        if registration.port == 0 {
            return Err(RegistryError::InvalidRegistration("port must be non-zero".into()));
        }
        if registration.total_slots == Some(0) {
            return Err(RegistryError::InvalidRegistration("total_slots must be positive".into()));
        }

        let _serial = self.registrations.lock().await;

        let endpoint = format!("{}:{}", registration.hostname, registration.port);
        let existing_id = match &registration.id {
            Some(id) => Some(id.clone()),
            None => self
                .backend
                .list_workers()
                .await?
                .into_iter()
                .find(|w| w.endpoint_key() == endpoint)
                .map(|w| w.id),
        };
        let id = existing_id.unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));

        let _guard = self.locks.lock(&id).await;
        let address = registration
            .address
            .clone()
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| registration.hostname.clone());

        let worker = match self.backend.load_worker(&id).await? {
            Some(mut worker) => {
                worker.hostname = registration.hostname;
                worker.address = address;
                worker.port = registration.port;
                worker.capabilities = registration.capabilities;
                if let Some(total) = registration.total_slots {
                    worker.total_slots = total;
                }
                worker.status = WorkerStatus::Online;
                worker.last_heartbeat = Some(now);
                worker.rpc_failures = 0;
                worker.refresh_load_status(self.settings.busy_threshold_percent);
                info!(worker_id = %worker.id, endpoint = %endpoint, "Worker re-registered");
                worker
            }
            None => {
                let mut worker = Worker {
                    id: id.clone(),
                    hostname: registration.hostname,
                    address,
                    port: registration.port,
                    capabilities: registration.capabilities,
                    status: WorkerStatus::Online,
                    total_slots: registration
                        .total_slots
                        .unwrap_or(self.settings.default_total_slots),
                    used_slots: 0,
                    current_tasks: BTreeSet::new(),
                    connected_at: Some(now),
                    last_heartbeat: Some(now),
                    health_metrics: None,
                    reported_slots: None,
                    rpc_failures: 0,
                };
                worker.refresh_load_status(self.settings.busy_threshold_percent);
                info!(
                    worker_id = %worker.id,
                    endpoint = %endpoint,
                    total_slots = worker.total_slots,
                    "Worker registered"
                );
                worker
            }
        };

        self.backend.save_worker(&worker).await?;
        Ok(worker)
    }

    /// Record a liveness signal; offline and errored workers come back online
    pub async fn heartbeat(&self, id: &str, report: LoadReport, now: DateTime<Utc>) -> Result<Worker> {
        let _guard = self.locks.lock(id).await;
        let mut worker = self.load(id).await?;

        let previous = worker.status;
        worker.last_heartbeat = Some(now);
        worker.rpc_failures = 0;
        if let Some(metrics) = report.health_metrics {
            worker.health_metrics = Some(metrics);
        }
        if let Some(total) = report.total_slots.filter(|t| *t > 0) {
            worker.total_slots = total;
        }
        if let Some(reported) = report.used_slots {
            if reported != worker.used_slots {
                debug!(
                    worker_id = %id,
                    reported,
                    tracked = worker.used_slots,
                    "Reported slot usage differs from tracked assignments"
                );
            }
            worker.reported_slots = Some(reported);
        }
        if !previous.is_active() {
            worker.status = WorkerStatus::Online;
        }
        worker.refresh_load_status(self.settings.busy_threshold_percent);

        self.backend.save_worker(&worker).await?;
        if previous != worker.status {
            info!(worker_id = %id, from = %previous, to = %worker.status, "Worker status changed");
        }
        Ok(worker)
    }

    pub async fn find(&self, id: &str) -> Result<Option<Worker>> {
        Ok(self.backend.load_worker(id).await?)
    }

    pub async fn get(&self, id: &str) -> Result<Worker> {
        self.load(id).await
    }

    /// Point-in-time copy of the whole fleet, ordered by id
    pub async fn snapshot(&self) -> Result<Vec<Worker>> {
        let mut workers = self.backend.list_workers().await?;
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }

    pub async fn list_by_status(&self, status: WorkerStatus) -> Result<Vec<Worker>> {
        let mut workers = self.snapshot().await?;
        workers.retain(|w| w.status == status);
        Ok(workers)
    }

    /// Worker count per status, every status present
    pub async fn counts(&self) -> Result<BTreeMap<&'static str, usize>> {
        let mut counts: BTreeMap<&'static str, usize> =
            WorkerStatus::ALL.iter().map(|s| (s.as_str(), 0)).collect();
        for worker in self.backend.list_workers().await? {
            *counts.entry(worker.status.as_str()).or_default() += 1;
        }
        Ok(counts)
    }

    /// Returns true if the worker was not already offline
    pub async fn mark_offline(&self, id: &str) -> Result<bool> {
        let _guard = self.locks.lock(id).await;
        let mut worker = self.load(id).await?;
        if worker.status == WorkerStatus::Offline {
            return Ok(false);
        }

        let previous = worker.status;
        worker.status = WorkerStatus::Offline;
        self.backend.save_worker(&worker).await?;
        warn!(worker_id = %id, from = %previous, last_heartbeat = ?worker.last_heartbeat, "Worker marked offline");
        Ok(true)
    }

    /// Mark `id` offline if it has been silent longer than `timeout` at `now`
    ///
    /// Silence is judged on the stored record under the worker lock, so a
    /// heartbeat that lands after a caller's snapshot always wins.
    pub async fn expire(&self, id: &str, now: DateTime<Utc>, timeout: chrono::Duration) -> Result<Expiry> {
        let _guard = self.locks.lock(id).await;
        let Some(mut worker) = self.backend.load_worker(id).await? else {
            return Ok(Expiry::Gone);
        };
        if !is_silent(&worker, now, timeout) {
            return Ok(Expiry::Fresh);
        }
        if worker.status == WorkerStatus::Offline {
            return Ok(Expiry::AlreadyOffline);
        }

        let previous = worker.status;
        worker.status = WorkerStatus::Offline;
        self.backend.save_worker(&worker).await?;
        warn!(worker_id = %id, from = %previous, last_heartbeat = ?worker.last_heartbeat, "Worker marked offline");
        Ok(Expiry::MarkedOffline)
    }

    /// Delete `id` only if it is still silent past `threshold` at `now`
    pub async fn remove_if_silent(&self, id: &str, now: DateTime<Utc>, threshold: chrono::Duration) -> Result<bool> {
        let _guard = self.locks.lock(id).await;
        let Some(worker) = self.backend.load_worker(id).await? else {
            return Ok(false);
        };
        if !is_silent(&worker, now, threshold) {
            debug!(worker_id = %id, "Worker came back before removal");
            return Ok(false);
        }
        let removed = self.backend.delete_worker(id).await?;
        if removed {
            info!(worker_id = %id, "Worker removed");
        }
        Ok(removed)
    }

    /// Returns true if a record was removed
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let _guard = self.locks.lock(id).await;
        let removed = self.backend.delete_worker(id).await?;
        if removed {
            info!(worker_id = %id, "Worker removed");
        }
        Ok(removed)
    }

    /// Claim one slot on `worker_id` for `task_id`
    ///
    /// Capacity is re-checked here against the stored record, not the
    /// snapshot the choice was made from.
    pub async fn reserve(&self, worker_id: &str, task_id: &str) -> Result<Worker> {
        let _guard = self.locks.lock(worker_id).await;
        let mut worker = self.load(worker_id).await?;

        if !worker.status.is_active() {
            return Err(RegistryError::Unavailable {
                worker_id: worker_id.to_string(),
                status: worker.status,
            });
        }
        if worker.current_tasks.contains(task_id) {
            return Ok(worker);
        }
        if worker.used_slots >= worker.total_slots {
            return Err(RegistryError::NoCapacity(worker_id.to_string()));
        }

        worker.current_tasks.insert(task_id.to_string());
        worker.used_slots = worker.current_tasks.len() as u32;
        worker.refresh_load_status(self.settings.busy_threshold_percent);
        self.backend.save_worker(&worker).await?;
        debug!(worker_id, task_id, used_slots = worker.used_slots, "Slot reserved");
        Ok(worker)
    }

    /// Give back the slot `task_id` held; a missing worker is not an error
    pub async fn release(&self, worker_id: &str, task_id: &str) -> Result<bool> {
        let _guard = self.locks.lock(worker_id).await;
        let Some(mut worker) = self.backend.load_worker(worker_id).await? else {
            return Ok(false);
        };
        if !worker.current_tasks.remove(task_id) {
            return Ok(false);
        }

        worker.used_slots = worker.current_tasks.len() as u32;
        worker.refresh_load_status(self.settings.busy_threshold_percent);
        self.backend.save_worker(&worker).await?;
        debug!(worker_id, task_id, used_slots = worker.used_slots, "Slot released");
        Ok(true)
    }

    /// Count a failed call to the worker's RPC surface
    ///
    /// At the configured threshold the worker enters `error` and stops
    /// receiving assignments until it heartbeats again.
    pub async fn record_rpc_failure(&self, id: &str) -> Result<Option<Worker>> {
        let _guard = self.locks.lock(id).await;
        let Some(mut worker) = self.backend.load_worker(id).await? else {
            return Ok(None);
        };

        worker.rpc_failures += 1;
        if worker.rpc_failures >= self.settings.rpc_failure_threshold && worker.status.is_active() {
            worker.status = WorkerStatus::Error;
            warn!(worker_id = %id, failures = worker.rpc_failures, "Worker entered error state");
        }
        self.backend.save_worker(&worker).await?;
        Ok(Some(worker))
    }

    pub async fn record_rpc_success(&self, id: &str) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        if let Some(mut worker) = self.backend.load_worker(id).await? {
            if worker.rpc_failures > 0 {
                worker.rpc_failures = 0;
                self.backend.save_worker(&worker).await?;
            }
        }
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Worker> {
        self.backend
            .load_worker(id)
            .await?
            .ok_or_else(|| RegistryError::UnknownWorker(id.to_string()))
    }
}

/// Silent past `timeout`; a worker never heard from is not judged
pub fn is_silent(worker: &Worker, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
    worker
        .last_heartbeat
        .or(worker.connected_at)
        .is_some_and(|last_seen| now - last_seen > timeout)
}
