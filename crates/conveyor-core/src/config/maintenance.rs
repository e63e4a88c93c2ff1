use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Stream trimming and record retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Seconds between maintenance passes.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Acknowledged records kept per queue stream.
    #[serde(default = "default_stream_max_len")]
    pub stream_max_len: usize,

    /// Seconds terminal status records are kept.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Seconds any status record lives after its last update.
    #[serde(default = "default_status_ttl")]
    pub status_ttl_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            stream_max_len: default_stream_max_len(),
            retention_secs: default_retention(),
            status_ttl_secs: default_status_ttl(),
        }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }
}

fn default_interval() -> u64 {
    60
}

fn default_stream_max_len() -> usize {
    10_000
}

fn default_retention() -> u64 {
    24 * 60 * 60
}

fn default_status_ttl() -> u64 {
    7 * 24 * 60 * 60
}
