//! Task lifecycle transitions
//!
//! ```text
//!              assign            progress
//!   pending ──────────▶ assigned ─────────▶ downloading ◀─┐ progress
//!      ▲                   │  │                │  │  └────┘
//!      │ fail(retriable)   │  │ complete       │  │ complete
//!      └───────────────────┘  └──▶ completed ◀─┘  │
//!                                                 │ fail(final)
//!   any non-terminal ── cancel ──▶ cancelled      ▼
//!                                               failed
//! ```
//!
//! [`transition`] is pure: it mutates the task it is given and reports what
//! happened, and never touches storage. Terminal states are final. Late
//! progress reports for terminal tasks are [`Outcome::Stale`], every other
//! event on a terminal task is an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::AssignmentConfig;
use crate::model::{Task, TaskStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Assign {
        worker_id: String,
        engine_handle: Option<String>,
    },
    /// Bind the engine's transfer id to an in-flight task
    AttachHandle {
        worker_id: String,
        engine_handle: String,
    },
    Progress {
        progress: f64,
        download_speed: Option<u64>,
    },
    Complete {
        result: Option<Value>,
    },
    Fail {
        reason: String,
        retriable: bool,
    },
    Cancel,
}

impl TaskEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Assign { .. } => "assign",
            TaskEvent::AttachHandle { .. } => "attach_handle",
            TaskEvent::Progress { .. } => "progress",
            TaskEvent::Complete { .. } => "complete",
            TaskEvent::Fail { .. } => "fail",
            TaskEvent::Cancel => "cancel",
        }
    }
}

/// What a transition did to the task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// State changed as requested
    Applied,
    /// Retriable failure sent the task back to pending
    Recycled,
    /// Late or foreign update, task left untouched
    Stale,
}

#[derive(Debug, Error, PartialEq)]
pub enum TransitionError {
    #[error("task {task_id} is already {status}")]
    AlreadyAssigned { task_id: String, status: TaskStatus },

    #[error("task {task_id} is {status} and can no longer change")]
    Terminal { task_id: String, status: TaskStatus },

    #[error("cannot {event} task {task_id} while {status}")]
    Invalid {
        task_id: String,
        status: TaskStatus,
        event: &'static str,
    },
}

/// Retry budget applied to retriable failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: chrono::Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: chrono::Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }
}

impl From<&AssignmentConfig> for RetryPolicy {
    fn from(config: &AssignmentConfig) -> Self {
        Self::new(config.max_retries, config.retry_delay.as_chrono())
    }
}

pub fn transition(
    task: &mut Task,
    event: &TaskEvent,
    now: DateTime<Utc>,
    policy: &RetryPolicy,
) -> Result<Outcome, TransitionError> {
    let status = task.status;

    if status.is_terminal() {
        return match event {
            TaskEvent::Progress { .. } | TaskEvent::AttachHandle { .. } => Ok(Outcome::Stale),
            _ => Err(TransitionError::Terminal {
                task_id: task.id.clone(),
                status,
            }),
        };
    }

    let outcome = match event {
        TaskEvent::Assign {
            worker_id,
            engine_handle,
        } => {
            if status != TaskStatus::Pending {
                return Err(TransitionError::AlreadyAssigned {
                    task_id: task.id.clone(),
                    status,
                });
            }
            task.status = TaskStatus::Assigned;
            task.worker_id = Some(worker_id.clone());
            task.engine_handle = engine_handle.clone();
            task.retry_after = None;
            task.progress = 0.0;
            task.download_speed = None;
            Outcome::Applied
        }
        TaskEvent::AttachHandle {
            worker_id,
            engine_handle,
        } => {
            if !status.is_in_flight() || task.worker_id.as_deref() != Some(worker_id.as_str()) {
                return Ok(Outcome::Stale);
            }
            task.engine_handle = Some(engine_handle.clone());
            Outcome::Applied
        }
        TaskEvent::Progress {
            progress,
            download_speed,
        } => {
            if !status.is_in_flight() {
                return Err(invalid(task, event));
            }
            task.status = TaskStatus::Downloading;
            task.progress = clamp_progress(*progress);
            if download_speed.is_some() {
                task.download_speed = *download_speed;
            }
            Outcome::Applied
        }
        TaskEvent::Complete { result } => {
            if !status.is_in_flight() {
                return Err(invalid(task, event));
            }
            task.status = TaskStatus::Completed;
            task.progress = 100.0;
            task.result = result.clone();
            task.error_message = None;
            Outcome::Applied
        }
        TaskEvent::Fail { reason, retriable } => {
            if !status.is_in_flight() {
                return Err(invalid(task, event));
            }
            task.error_message = Some(reason.clone());
            if *retriable && task.retries < policy.max_retries {
                task.status = TaskStatus::Pending;
                task.retries += 1;
                task.worker_id = None;
                task.engine_handle = None;
                task.progress = 0.0;
                task.download_speed = None;
                task.retry_after = Some(now + policy.retry_delay);
                Outcome::Recycled
            } else {
                task.status = TaskStatus::Failed;
                task.download_speed = None;
                Outcome::Applied
            }
        }
        TaskEvent::Cancel => {
            task.status = TaskStatus::Cancelled;
            task.download_speed = None;
            task.retry_after = None;
            Outcome::Applied
        }
    };

    task.updated_at = now;
    Ok(outcome)
}

fn invalid(task: &Task, event: &TaskEvent) -> TransitionError {
    TransitionError::Invalid {
        task_id: task.id.clone(),
        status: task.status,
        event: event.name(),
    }
}

fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        return 0.0;
    }
    progress.clamp(0.0, 100.0)
}
