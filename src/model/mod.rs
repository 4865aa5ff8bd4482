//! Core entities owned by the dispatcher: download tasks and worker nodes.

mod task;
mod worker;

pub use task::{TAGS_OPTION, Task, TaskOptions, TaskPriority, TaskStatus};
pub use worker::{Capabilities, HealthMetrics, LoadReport, Worker, WorkerStatus};
