//! Per-key async mutual exclusion
//!
//! Task transitions lock by task id and slot accounting locks by worker id,
//! so unrelated tasks and workers never contend. When both are needed the
//! task lock is always taken first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Guard held for the duration of a keyed critical section
pub type KeyGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            // Drop entries nobody holds or waits on
            slots.retain(|k, m| k == key || Arc::strong_count(m) > 1);
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
