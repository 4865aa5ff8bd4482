//! Worker-side agent contract
//!
//! The dispatcher never drives a download engine itself. It hands a task to
//! the agent running next to the worker's engine and gets back the engine's
//! handle for that transfer, and it can ask the agent to cancel a handle.
//! Every call is bounded; a timeout is a transient failure like any other.

mod http;

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::model::{Task, Worker};

pub use http::{HttpAgent, HttpAgentConfig, SubmitRequest, SubmitResponse};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("RPC request failed: {0}")]
    RequestFailed(String),

    #[error("RPC call timed out")]
    Timeout,

    #[error("worker rejected call with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid response from worker: {0}")]
    InvalidResponse(String),
}

impl AgentError {
    /// Whether a second attempt could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::RequestFailed(_) | AgentError::Timeout => true,
            AgentError::Rejected { status, .. } => *status >= 500,
            AgentError::InvalidResponse(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[async_trait]
pub trait WorkerAgent: Send + Sync {
    /// Start `task` on `worker`; returns the engine handle of the transfer
    async fn submit(&self, worker: &Worker, task: &Task) -> Result<String>;

    /// Best-effort stop of the transfer identified by `engine_handle`
    async fn cancel(&self, worker: &Worker, engine_handle: &str) -> Result<()>;
}

/// In-process agent for tests and dry runs
///
/// Hands out sequential `gid-N` handles. Workers can be switched into a
/// failing mode to simulate an unreachable RPC surface, or slowed down.
#[derive(Debug, Default)]
pub struct MockAgent {
    next_handle: AtomicU64,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    submitted: Mutex<Vec<(String, String)>>,
    cancelled: Mutex<Vec<(String, String)>>,
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call to `worker_id` fail until [`MockAgent::heal_worker`]
    pub fn fail_worker(&self, worker_id: &str) {
        lock(&self.failing).insert(worker_id.to_string());
    }

    pub fn heal_worker(&self, worker_id: &str) {
        lock(&self.failing).remove(worker_id);
    }

    /// Make every submit to `worker_id` take at least `delay`
    pub fn delay_worker(&self, worker_id: &str, delay: Duration) {
        lock(&self.delays).insert(worker_id.to_string(), delay);
    }

    /// `(worker_id, task_id)` for every accepted submission
    pub fn submissions(&self) -> Vec<(String, String)> {
        lock(&self.submitted).clone()
    }

    /// `(worker_id, engine_handle)` for every cancel call
    pub fn cancellations(&self) -> Vec<(String, String)> {
        lock(&self.cancelled).clone()
    }

    fn check(&self, worker: &Worker) -> Result<()> {
        if lock(&self.failing).contains(&worker.id) {
            return Err(AgentError::RequestFailed(format!(
                "connection refused by {}",
                worker.rpc_base_url()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerAgent for MockAgent {
    async fn submit(&self, worker: &Worker, task: &Task) -> Result<String> {
        let delay = lock(&self.delays).get(&worker.id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check(worker)?;
        let handle = format!("gid-{}", self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        lock(&self.submitted).push((worker.id.clone(), task.id.clone()));
        tracing::info!(worker_id = %worker.id, task_id = %task.id, %handle, "Mock submit");
        Ok(handle)
    }

    async fn cancel(&self, worker: &Worker, engine_handle: &str) -> Result<()> {
        lock(&self.cancelled).push((worker.id.clone(), engine_handle.to_string()));
        self.check(worker)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Capabilities, TaskOptions, TaskPriority, WorkerStatus};
    use std::collections::BTreeSet;

    fn worker(id: &str) -> Worker {
        Worker {
            id: id.to_string(),
            hostname: "node".to_string(),
            address: "127.0.0.1".to_string(),
            port: 6800,
            capabilities: Capabilities::default(),
            status: WorkerStatus::Online,
            total_slots: 2,
            used_slots: 0,
            current_tasks: BTreeSet::new(),
            connected_at: None,
            last_heartbeat: None,
            health_metrics: None,
            reported_slots: None,
            rpc_failures: 0,
        }
    }

    #[tokio::test]
    async fn test_mock_agent_hands_out_unique_handles() {
        let agent = MockAgent::new();
        let w = worker("worker-a");
        let t1 = Task::new("https://example.com/1", TaskOptions::new(), TaskPriority::Normal);
        let t2 = Task::new("https://example.com/2", TaskOptions::new(), TaskPriority::Normal);

        assert_eq!(agent.submit(&w, &t1).await.unwrap(), "gid-1");
        assert_eq!(agent.submit(&w, &t2).await.unwrap(), "gid-2");
        assert_eq!(agent.submissions().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_agent_failing_worker() {
        let agent = MockAgent::new();
        let w = worker("worker-a");
        let task = Task::new("https://example.com/1", TaskOptions::new(), TaskPriority::Normal);

        agent.fail_worker("worker-a");
        let err = agent.submit(&w, &task).await.unwrap_err();
        assert!(err.is_transient());
        assert!(agent.cancel(&w, "gid-1").await.is_err());
        assert_eq!(agent.cancellations(), vec![("worker-a".to_string(), "gid-1".to_string())]);

        agent.heal_worker("worker-a");
        assert!(agent.submit(&w, &task).await.is_ok());
    }

    #[test]
    fn test_transient_classification() {
        assert!(AgentError::Timeout.is_transient());
        assert!(
            AgentError::Rejected {
                status: 503,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            !AgentError::Rejected {
                status: 400,
                message: String::new()
            }
            .is_transient()
        );
        assert!(!AgentError::InvalidResponse("bad".into()).is_transient());
    }
}
