use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Busy,
    Offline,
    Error,
}

impl WorkerStatus {
    pub const ALL: [WorkerStatus; 4] = [
        WorkerStatus::Online,
        WorkerStatus::Busy,
        WorkerStatus::Offline,
        WorkerStatus::Error,
    ];

    /// Online or busy: the worker may receive assignments
    pub fn is_active(&self) -> bool {
        matches!(self, WorkerStatus::Online | WorkerStatus::Busy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Online => "online",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Offline => "offline",
            WorkerStatus::Error => "error",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkerStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown worker status '{s}'"))
    }
}

/// What a worker declares it can do
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Free disk space in bytes
    pub disk_space: Option<u64>,
    /// Bandwidth in bytes/second
    pub bandwidth: Option<u64>,
    #[serde(default)]
    pub protocols: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Anything else the worker advertises, kept as-is
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Capabilities {
    /// True when every requested pair is present and equal in this worker's tags
    pub fn matches_tags(&self, wanted: &BTreeMap<String, String>) -> bool {
        wanted
            .iter()
            .all(|(key, value)| self.tags.get(key) == Some(value))
    }
}

/// Informational resource usage snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
}

/// Load snapshot carried by a heartbeat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub used_slots: Option<u32>,
    pub total_slots: Option<u32>,
    pub health_metrics: Option<HealthMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub hostname: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub capabilities: Capabilities,
    pub status: WorkerStatus,
    pub total_slots: u32,
    pub used_slots: u32,
    #[serde(default)]
    pub current_tasks: BTreeSet<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub health_metrics: Option<HealthMetrics>,
    /// Slot usage as last reported by the worker itself
    pub reported_slots: Option<u32>,
    /// Consecutive failed RPC calls to the worker's local surface
    #[serde(default)]
    pub rpc_failures: u32,
}

impl Worker {
    /// `hostname:port`, the identity used for registrations without an id
    pub fn endpoint_key(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn rpc_base_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }

    pub fn available_slots(&self) -> u32 {
        self.total_slots.saturating_sub(self.used_slots)
    }

    pub fn load_percentage(&self) -> f64 {
        if self.total_slots == 0 {
            return 100.0;
        }
        f64::from(self.used_slots) / f64::from(self.total_slots) * 100.0
    }

    /// Eligible for assignment: active and with a free slot
    pub fn is_eligible(&self) -> bool {
        self.status.is_active() && self.used_slots < self.total_slots
    }

    /// Re-derive online/busy from current load; other states are left alone
    pub fn refresh_load_status(&mut self, busy_threshold_percent: u8) {
        if !self.status.is_active() {
            return;
        }
        self.status = if self.load_percentage() >= f64::from(busy_threshold_percent) {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Online
        };
    }
}
