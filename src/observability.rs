//! Observability (tracing setup and in-process counters)

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins when set; otherwise `default_directive` (from
/// `telemetry.log_level`) is used.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // A second init (e.g. in tests) is harmless
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Metrics handle for recording dispatcher counters
#[derive(Debug, Default)]
pub struct Metrics {
    tasks_created: AtomicU64,
    tasks_assigned: AtomicU64,
    tasks_recycled: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_cancelled: AtomicU64,
    stale_updates: AtomicU64,
    dispatch_failures: AtomicU64,
    workers_offline: AtomicU64,
    workers_removed: AtomicU64,
}

macro_rules! counter {
    ($method:ident, $field:ident) => {
        pub fn $method(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(counter = stringify!($field), "Metric incremented");
        }
    };
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(task_created, tasks_created);
    counter!(task_assigned, tasks_assigned);
    counter!(task_recycled, tasks_recycled);
    counter!(task_failed, tasks_failed);
    counter!(task_completed, tasks_completed);
    counter!(task_cancelled, tasks_cancelled);
    counter!(stale_update, stale_updates);
    counter!(dispatch_failed, dispatch_failures);
    counter!(worker_offline, workers_offline);
    counter!(worker_removed, workers_removed);

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_created: self.tasks_created.load(Ordering::Relaxed),
            tasks_assigned: self.tasks_assigned.load(Ordering::Relaxed),
            tasks_recycled: self.tasks_recycled.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            stale_updates: self.stale_updates.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            workers_offline: self.workers_offline.load(Ordering::Relaxed),
            workers_removed: self.workers_removed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_created: u64,
    pub tasks_assigned: u64,
    pub tasks_recycled: u64,
    pub tasks_failed: u64,
    pub tasks_completed: u64,
    pub tasks_cancelled: u64,
    pub stale_updates: u64,
    pub dispatch_failures: u64,
    pub workers_offline: u64,
    pub workers_removed: u64,
}
