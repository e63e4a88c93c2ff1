use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker status in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Worker is consuming its queues.
    Active,
    /// Worker is finishing in-flight jobs and refuses new ones.
    Draining,
}

impl WorkerStatus {
    /// Convert to string for broker storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Draining => "draining",
        }
    }

    /// Parse from string.
    pub fn from_str(s: &str) -> Self {
        match s {
            "draining" => Self::Draining,
            _ => Self::Active,
        }
    }

    /// Check if the worker can accept new work.
    pub fn can_accept_work(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Membership record a worker keeps alive in the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub hostname: String,
    /// Queues the worker consumes.
    pub queues: Vec<String>,
    pub status: WorkerStatus,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerRegistration {
    /// Registration for the local worker.
    pub fn new_local(
        worker_id: impl Into<String>,
        hostname: impl Into<String>,
        queues: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            worker_id: worker_id.into(),
            hostname: hostname.into(),
            queues,
            status: WorkerStatus::Active,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: now,
            last_heartbeat: now,
        }
    }

    /// Check if this worker consumes the given queue.
    pub fn serves(&self, queue: &str) -> bool {
        self.queues.iter().any(|q| q == queue)
    }

    /// Refresh the heartbeat timestamp.
    pub fn touch(&mut self) {
        self.last_heartbeat = Utc::now();
    }
}
