//! Failure and retry supervisor
//!
//! A background loop, independent of request traffic, that:
//! - marks workers offline once their heartbeat is older than `heartbeat_timeout`
//! - reclaims in-flight tasks of offline or vanished workers
//! - removes long-silent workers when `auto_remove_offline` is set
//! - optionally reclaims tasks stuck in `assigned`
//! - releases slot bookings that no longer match a running task
//! - offers pending tasks to the assignment engine
//!
//! Every step re-reads current state, so a sweep can be repeated any number
//! of times with the same result. Errors are logged and the next tick tries
//! again.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::dispatcher::{Dispatcher, Result};
use crate::model::TaskStatus;
use crate::registry::{Expiry, is_silent};

pub const REASON_UNREACHABLE: &str = "worker unreachable";
pub const REASON_REMOVED: &str = "worker removed";
pub const REASON_STUCK: &str = "task never started on worker";

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub sweep_interval: Duration,
    pub schedule_interval: Duration,
    pub heartbeat_timeout: chrono::Duration,
    pub offline_threshold: chrono::Duration,
    pub auto_remove_offline: bool,
    pub stuck_task_timeout: Option<chrono::Duration>,
}

impl From<&Config> for SupervisorSettings {
    fn from(config: &Config) -> Self {
        Self {
            sweep_interval: config.workers.heartbeat_interval.as_duration(),
            schedule_interval: config.assignment.schedule_interval.as_duration(),
            heartbeat_timeout: config.workers.heartbeat_timeout.as_chrono(),
            offline_threshold: config.workers.offline_threshold.as_chrono(),
            auto_remove_offline: config.workers.auto_remove_offline,
            stuck_task_timeout: config.assignment.stuck_task_timeout.map(|t| t.as_chrono()),
        }
    }
}

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub workers_marked_offline: usize,
    pub workers_removed: usize,
    pub tasks_reclaimed: usize,
    pub stuck_tasks_reclaimed: usize,
    pub slots_released: usize,
    pub tasks_assigned: usize,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Supervisor {
    dispatcher: Arc<Dispatcher>,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(dispatcher: Arc<Dispatcher>, settings: SupervisorSettings) -> Self {
        Self {
            dispatcher,
            settings,
        }
    }

    /// Run one reconciliation pass as of `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let registry = self.dispatcher.registry();
        let workers = registry.snapshot().await?;

        for worker in &workers {
            // The snapshot only nominates; the registry re-checks under the
            // worker lock in case a heartbeat arrived since
            if !is_silent(worker, now, self.settings.heartbeat_timeout) {
                continue;
            }

            match self
                .dispatcher
                .expire_worker_at(&worker.id, self.settings.heartbeat_timeout, now)
                .await?
            {
                Expiry::MarkedOffline => {
                    self.dispatcher.metrics().worker_offline();
                    report.workers_marked_offline += 1;
                }
                Expiry::AlreadyOffline => {}
                Expiry::Fresh | Expiry::Gone => {
                    debug!(worker_id = %worker.id, "Worker changed since snapshot, skipping");
                    continue;
                }
            }

            for task in self.dispatcher.tasks().in_flight_on(&worker.id).await? {
                if self
                    .dispatcher
                    .reclaim_at(&task.id, &worker.id, REASON_UNREACHABLE, now)
                    .await?
                    .is_some()
                {
                    report.tasks_reclaimed += 1;
                }
            }

            if self.settings.auto_remove_offline && is_silent(worker, now, self.settings.offline_threshold) {
                let removal = self
                    .dispatcher
                    .remove_silent_worker_at(&worker.id, self.settings.offline_threshold, REASON_REMOVED, now)
                    .await?;
                report.tasks_reclaimed += removal.tasks_recycled;
                if removal.removed {
                    report.workers_removed += 1;
                    info!(worker_id = %worker.id, "Removed silent worker");
                }
            }
        }

        report.tasks_reclaimed += self.reclaim_orphans(now).await?;
        report.stuck_tasks_reclaimed = self.reclaim_stuck(now).await?;
        report.slots_released = self.dispatcher.reconcile_slots().await?;
        report.tasks_assigned = self.dispatcher.schedule_pending_at(now).await?.assigned;

        Ok(report)
    }

    /// In-flight tasks whose worker record no longer exists
    async fn reclaim_orphans(&self, now: DateTime<Utc>) -> Result<usize> {
        let known: HashSet<String> = self
            .dispatcher
            .registry()
            .snapshot()
            .await?
            .into_iter()
            .map(|w| w.id)
            .collect();

        let mut reclaimed = 0;
        for task in self.dispatcher.tasks().list().await? {
            let Some(worker_id) = task.worker_id.as_deref() else {
                continue;
            };
            if task.status.is_in_flight()
                && !known.contains(worker_id)
                && self
                    .dispatcher
                    .reclaim_at(&task.id, worker_id, REASON_UNREACHABLE, now)
                    .await?
                    .is_some()
            {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn reclaim_stuck(&self, now: DateTime<Utc>) -> Result<usize> {
        let Some(timeout) = self.settings.stuck_task_timeout else {
            return Ok(0);
        };

        let mut reclaimed = 0;
        for task in self.dispatcher.tasks().list_by_status(TaskStatus::Assigned).await? {
            if now - task.updated_at <= timeout {
                continue;
            }
            let Some(worker_id) = task.worker_id.as_deref() else {
                continue;
            };
            if self
                .dispatcher
                .reclaim_at(&task.id, worker_id, REASON_STUCK, now)
                .await?
                .is_some()
            {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Sweep every `heartbeat_interval` and schedule every `schedule_interval`
    /// until `shutdown` flips
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut sweep = tokio::time::interval(self.settings.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut schedule = tokio::time::interval(self.settings.schedule_interval);
        schedule.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            sweep_secs = self.settings.sweep_interval.as_secs_f64(),
            schedule_secs = self.settings.schedule_interval.as_secs_f64(),
            "Supervisor started"
        );

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    match self.sweep_at(Utc::now()).await {
                        Ok(report) if !report.is_quiet() => info!(?report, "Supervisor sweep"),
                        Ok(_) => debug!("Supervisor sweep found nothing to do"),
                        Err(e) => error!(error = %e, "Supervisor sweep failed, retrying next tick"),
                    }
                }
                _ = schedule.tick() => {
                    if let Err(e) = self.dispatcher.schedule_pending().await {
                        error!(error = %e, "Scheduling pass failed, retrying next tick");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Supervisor stopping");
                    break;
                }
            }
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
