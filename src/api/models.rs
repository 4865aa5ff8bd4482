//! Request and response bodies of the dispatcher HTTP API.
//!
//! Task submission (`POST /tasks`):
//!
//! ```json
//! {
//!   "url": "https://mirror.example.com/ubuntu.iso",
//!   "options": {
//!     "dir": "/downloads/iso",
//!     "max-connection-per-server": "4",
//!     "tags": { "content_type": "video", "region": "eu" }
//!   },
//!   "priority": "high"
//! }
//! ```
//!
//! Everything under `options` except `tags` is handed to the worker as-is.
//! `tags` must map strings to strings; the assignment engine matches it
//! against the tags a worker declares in its capabilities.
//!
//! Worker progress (`PUT /tasks/{id}`):
//!
//! ```json
//! {
//!   "worker_id": "worker-7c1e…",
//!   "status": "downloading",
//!   "progress": 41.5,
//!   "download_speed": 5242880,
//!   "engine_handle": "2089b05ecca3d829"
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::dispatcher::NewTask;
use crate::model::{Task, TaskOptions, TaskPriority};
use crate::tasks::Outcome;

pub use crate::dispatcher::{FleetSummary as StatusResponse, ReportedStatus, TaskReport};
pub use crate::model::LoadReport as HeartbeatRequest;
pub use crate::registry::Registration as RegisterWorkerRequest;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreateTaskRequest {
    pub url: String,
    #[serde(default)]
    pub options: TaskOptions,
    #[serde(default)]
    pub priority: TaskPriority,
}

impl From<CreateTaskRequest> for NewTask {
    fn from(value: CreateTaskRequest) -> Self {
        NewTask {
            url: value.url.trim().to_string(),
            options: value.options,
            priority: value.priority,
        }
    }
}

/// `?status=` filter shared by the list endpoints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportResponse {
    pub task: Task,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRemovedResponse {
    pub worker_id: String,
    pub tasks_recycled: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: HashMap<String, String>,
    pub version: String,
}
