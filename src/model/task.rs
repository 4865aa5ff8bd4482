use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Task options as submitted by the client, passed to the worker verbatim
pub type TaskOptions = Map<String, Value>;

/// Reserved options key holding the string->string tag map used for matching
pub const TAGS_OPTION: &str = "tags";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Assigned,
        TaskStatus::Downloading,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Assigned or downloading: the task occupies a worker slot
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Downloading)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub options: TaskOptions,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub progress: f64,
    pub download_speed: Option<u64>,
    pub worker_id: Option<String>,
    pub engine_handle: Option<String>,
    #[serde(default)]
    pub retries: u32,
    /// Earliest time a recycled task may be assigned again
    pub retry_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub result: Option<Value>,
}

impl Task {
    pub fn new(url: impl Into<String>, options: TaskOptions, priority: TaskPriority) -> Self {
        let now = Utc::now();
        Self {
            id: format!("task-{}", Uuid::now_v7()),
            url: url.into(),
            options,
            status: TaskStatus::Pending,
            priority,
            progress: 0.0,
            download_speed: None,
            worker_id: None,
            engine_handle: None,
            retries: 0,
            retry_after: None,
            created_at: now,
            updated_at: now,
            error_message: None,
            result: None,
        }
    }

    /// Tags requested for worker matching; non-string values are ignored
    pub fn tags(&self) -> BTreeMap<String, String> {
        self.options
            .get(TAGS_OPTION)
            .and_then(Value::as_object)
            .map(|tags| {
                tags.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether a pending task may be handed to the assignment engine at `now`
    pub fn is_schedulable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending
            && self.retry_after.is_none_or(|after| after <= now)
    }
}
