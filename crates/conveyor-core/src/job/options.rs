use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::traits::{JobMetadata, OverlapBehavior};

/// Per-call dispatch options. Unset fields fall back to the job type's metadata.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Identity override for the stable job id.
    pub job_id: Option<String>,
    /// Identity override for the dispatch id.
    pub dispatch_id: Option<Uuid>,
    /// Must name the queue of the handle dispatching. Other queues are
    /// reached through their own handle.
    pub queue: Option<String>,
    pub priority: Option<i32>,
    /// Run no earlier than this long after admission.
    pub delay: Option<Duration>,
    /// Run no earlier than this instant. Takes precedence over `delay`.
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub overlap: Option<OverlapBehavior>,
    pub overlap_delay: Option<Duration>,
}

impl DispatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the job id.
    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    /// Set the dispatch id.
    pub fn with_dispatch_id(mut self, id: Uuid) -> Self {
        self.dispatch_id = Some(id);
        self
    }

    /// Name the target queue explicitly.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Delay execution.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Schedule at a specific time.
    pub fn with_scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn with_overlap(mut self, overlap: OverlapBehavior) -> Self {
        self.overlap = Some(overlap);
        self
    }

    pub fn with_overlap_delay(mut self, delay: Duration) -> Self {
        self.overlap_delay = Some(delay);
        self
    }

    /// Merge with job type metadata; per-call values win.
    pub fn resolve(&self, meta: &JobMetadata) -> JobOptions {
        let scheduled_for = self.scheduled_for.or_else(|| {
            self.delay
                .map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_default())
        });

        JobOptions {
            priority: Some(self.priority.unwrap_or(meta.priority)),
            scheduled_for,
            max_retries: self.max_retries.or(meta.max_retries),
            retry_delay_ms: self.retry_delay.or(meta.retry_delay).map(duration_ms),
            overlap: Some(self.overlap.unwrap_or(meta.overlap)),
            overlap_delay_ms: self.overlap_delay.or(meta.overlap_delay).map(duration_ms),
        }
    }
}

/// Resolved options carried in the `options` field of a `job:process` event.
///
/// Fields left unset fall back to the job type's metadata on admission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap: Option<OverlapBehavior>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap_delay_ms: Option<u64>,
}

impl JobOptions {
    pub fn priority(&self) -> i32 {
        self.priority.unwrap_or_default()
    }

    pub fn overlap(&self) -> OverlapBehavior {
        self.overlap.unwrap_or_default()
    }

    /// Fill every unset field from the job type's metadata.
    pub fn or_metadata(&self, meta: &JobMetadata) -> JobOptions {
        JobOptions {
            priority: self.priority.or(Some(meta.priority)),
            scheduled_for: self.scheduled_for,
            max_retries: self.max_retries.or(meta.max_retries),
            retry_delay_ms: self.retry_delay_ms.or(meta.retry_delay.map(duration_ms)),
            overlap: self.overlap.or(Some(meta.overlap)),
            overlap_delay_ms: self.overlap_delay_ms.or(meta.overlap_delay.map(duration_ms)),
        }
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay_ms.map(Duration::from_millis)
    }

    pub fn overlap_delay(&self) -> Option<Duration> {
        self.overlap_delay_ms.map(Duration::from_millis)
    }
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}
