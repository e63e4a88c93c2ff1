use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker id. Generated from the hostname when unset.
    #[serde(default)]
    pub id: Option<String>,

    /// Workers started in this process.
    #[serde(default = "default_count")]
    pub count: usize,

    /// Fallback scheduler tick in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Expiry of NO_OVERLAP locks in seconds.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// Seconds between membership refreshes.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Seconds a membership record survives without a refresh.
    #[serde(default = "default_registration_ttl")]
    pub registration_ttl_secs: u64,

    /// Upper bound on a graceful stop, in seconds.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Concurrency of queues without their own entry.
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,

    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    #[serde(default = "default_retry_delay")]
    pub default_retry_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: None,
            count: default_count(),
            poll_interval_ms: default_poll_interval(),
            lock_ttl_secs: default_lock_ttl(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            registration_ttl_secs: default_registration_ttl(),
            drain_timeout_secs: default_drain_timeout(),
            default_concurrency: default_concurrency(),
            default_max_retries: default_max_retries(),
            default_retry_delay_ms: default_retry_delay(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn registration_ttl(&self) -> Duration {
        Duration::from_secs(self.registration_ttl_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Queue settings built from the worker defaults.
    pub fn default_queue(&self, name: impl Into<String>) -> QueueConfig {
        QueueConfig {
            name: name.into(),
            concurrency: self.default_concurrency,
            max_retries: self.default_max_retries,
            retry_delay_ms: self.default_retry_delay_ms,
            pause_on_error: false,
        }
    }
}

fn default_count() -> usize {
    1
}

fn default_poll_interval() -> u64 {
    500
}

fn default_lock_ttl() -> u64 {
    60
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_registration_ttl() -> u64 {
    30
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_concurrency() -> usize {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1000
}

/// Per-queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,

    /// Jobs of this queue running at once on one worker.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Pause the queue when a job fails for good.
    #[serde(default)]
    pub pause_on_error: bool,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        WorkerConfig::default().default_queue(name)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn with_pause_on_error(mut self, pause: bool) -> Self {
        self.pause_on_error = pause;
        self
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
