//! HTTP client for a worker's local RPC surface

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{AgentError, Result, WorkerAgent};
use crate::model::{Task, TaskOptions, Worker};

/// HTTP agent configuration
#[derive(Debug, Clone)]
pub struct HttpAgentConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub user_agent: String,
}

impl Default for HttpAgentConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            max_attempts: 2,
            backoff_base: Duration::from_millis(200),
            user_agent: concat!("fetchfleet/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpAgentConfig {
    /// Defaults with every call bounded by `rpc_timeout`
    pub fn with_timeout(rpc_timeout: Duration) -> Self {
        Self {
            connect_timeout: rpc_timeout.min(Duration::from_secs(5)),
            request_timeout: rpc_timeout,
            ..Self::default()
        }
    }
}

/// Body of `POST {worker}/tasks`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub task_id: String,
    pub url: String,
    #[serde(default)]
    pub options: TaskOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub engine_handle: String,
}

/// Agent that talks JSON over HTTP to the worker's RPC proxy
pub struct HttpAgent {
    client: Client,
    config: HttpAgentConfig,
}

impl HttpAgent {
    pub fn new(config: HttpAgentConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| AgentError::RequestFailed(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// Retry transient failures with exponential backoff
    async fn with_retry<T, F, Fut>(&self, what: &str, worker: &Worker, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match call().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(worker_id = %worker.id, what, attempts, "RPC succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempts < self.config.max_attempts => {
                    warn!(worker_id = %worker.id, what, attempts, error = %e, "RPC failed, retrying");
                    let backoff = self.config.backoff_base * 2u32.pow(attempts - 1);
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    warn!(worker_id = %worker.id, what, attempts, error = %e, "RPC failed");
                    return Err(e);
                }
            }
        }
    }

    async fn submit_once(&self, worker: &Worker, task: &Task) -> Result<String> {
        let url = format!("{}/tasks", worker.rpc_base_url());
        let body = SubmitRequest {
            task_id: task.id.clone(),
            url: task.url.clone(),
            options: task.options.clone(),
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let response = check_status(response).await?;

        let parsed: SubmitResponse = response
            .json()
            .await
            .map_err(|e| AgentError::InvalidResponse(e.to_string()))?;
        if parsed.engine_handle.is_empty() {
            return Err(AgentError::InvalidResponse("empty engine_handle".into()));
        }
        Ok(parsed.engine_handle)
    }

    async fn cancel_once(&self, worker: &Worker, engine_handle: &str) -> Result<()> {
        let url = cancel_url(worker, engine_handle)?;
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_status(response).await?;
        Ok(())
    }
}

#[async_trait]
impl WorkerAgent for HttpAgent {
    async fn submit(&self, worker: &Worker, task: &Task) -> Result<String> {
        debug!(worker_id = %worker.id, task_id = %task.id, "Submitting task to worker");
        self.with_retry("submit", worker, || self.submit_once(worker, task))
            .await
    }

    async fn cancel(&self, worker: &Worker, engine_handle: &str) -> Result<()> {
        debug!(worker_id = %worker.id, engine_handle, "Cancelling transfer on worker");
        self.with_retry("cancel", worker, || self.cancel_once(worker, engine_handle))
            .await
    }
}

/// `{base}/tasks/{handle}` with the handle as one escaped path segment
fn cancel_url(worker: &Worker, engine_handle: &str) -> Result<Url> {
    let mut url = Url::parse(&worker.rpc_base_url())
        .map_err(|e| AgentError::RequestFailed(format!("invalid worker address: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| AgentError::RequestFailed("worker address cannot carry a path".into()))?
        .pop_if_empty()
        .push("tasks")
        .push(engine_handle);
    Ok(url)
}

fn map_reqwest_error(e: reqwest::Error) -> AgentError {
    if e.is_timeout() {
        AgentError::Timeout
    } else {
        AgentError::RequestFailed(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    Err(AgentError::Rejected {
        status: status.as_u16(),
        message: if message.is_empty() {
            status.canonical_reason().unwrap_or("Unknown").to_string()
        } else {
            message
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_agent_config_defaults() {
        let config = HttpAgentConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.max_attempts, 2);
        assert!(config.user_agent.starts_with("fetchfleet/"));
    }

    #[test]
    fn test_cancel_url_escapes_handle() {
        let worker = Worker {
            id: "worker-a".to_string(),
            hostname: "node-a".to_string(),
            address: "10.0.0.7".to_string(),
            port: 6800,
            capabilities: Default::default(),
            status: crate::model::WorkerStatus::Online,
            total_slots: 2,
            used_slots: 0,
            current_tasks: Default::default(),
            connected_at: None,
            last_heartbeat: None,
            health_metrics: None,
            reported_slots: None,
            rpc_failures: 0,
        };

        let url = cancel_url(&worker, "2089b05ecca3d829").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.7:6800/tasks/2089b05ecca3d829");

        let url = cancel_url(&worker, "gid/7?force=1").unwrap();
        assert_eq!(url.path(), "/tasks/gid%2F7%3Fforce=1");
        assert!(url.query().is_none());
    }

    #[test]
    fn test_with_timeout_bounds_connect() {
        let config = HttpAgentConfig::with_timeout(Duration::from_secs(2));
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert_eq!(config.connect_timeout, Duration::from_secs(2));

        let config = HttpAgentConfig::with_timeout(Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }
}
