//! Persistence interface for task and worker records
//!
//! Every component reaches stored state only through [`Backend`]. Two
//! interchangeable implementations exist:
//!
//! - [`MemoryBackend`] - volatile, process-local maps
//! - [`FjallBackend`] - durable, embedded LSM keyspace with JSON values
//!
//! The backend is chosen once at startup via [`open`]; the only place two
//! backends meet is [`migrate`].

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::config::{StorageBackendKind, StorageConfig};
use crate::model::{Task, Worker};

mod durable;
mod keys;
mod memory;
mod migration;

pub use durable::FjallBackend;
pub use memory::MemoryBackend;
pub use migration::{MigrationStats, migrate};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid key format: {0}")]
    InvalidKey(String),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

/// CRUD contract shared by all persistence backends
///
/// Records round-trip verbatim: whatever is saved is what a later load returns.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn save_task(&self, task: &Task) -> Result<()>;

    async fn load_task(&self, id: &str) -> Result<Option<Task>>;

    async fn list_tasks(&self) -> Result<Vec<Task>>;

    /// Returns whether a record was removed
    async fn delete_task(&self, id: &str) -> Result<bool>;

    async fn save_worker(&self, worker: &Worker) -> Result<()>;

    async fn load_worker(&self, id: &str) -> Result<Option<Worker>>;

    async fn list_workers(&self) -> Result<Vec<Worker>>;

    /// Returns whether a record was removed
    async fn delete_worker(&self, id: &str) -> Result<bool>;

    /// Make previous writes durable (no-op for volatile backends)
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Liveness check used by the health endpoint
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> StorageBackendKind;
}

/// Open the backend selected in configuration
pub fn open(config: &StorageConfig) -> Result<Arc<dyn Backend>> {
    match config.backend {
        StorageBackendKind::Memory => {
            info!("Using in-memory storage backend");
            Ok(Arc::new(MemoryBackend::new()))
        }
        StorageBackendKind::Fjall => {
            info!(path = %config.path.display(), "Using fjall storage backend");
            Ok(Arc::new(FjallBackend::open(&config.path)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_memory_backend() {
        let config = StorageConfig {
            backend: StorageBackendKind::Memory,
            ..StorageConfig::default()
        };
        let backend = open(&config).unwrap();
        assert_eq!(backend.kind(), StorageBackendKind::Memory);
    }

    #[test]
    fn test_open_fjall_backend() {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            backend: StorageBackendKind::Fjall,
            path: temp_dir.path().join("dispatcher"),
        };
        let backend = open(&config).unwrap();
        assert_eq!(backend.kind(), StorageBackendKind::Fjall);
    }
}
