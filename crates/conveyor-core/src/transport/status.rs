use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobStatus;

use super::event::StatusEvent;

/// Identity of one dispatch as seen by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobKey {
    pub queue: String,
    pub job_id: String,
    pub dispatch_id: Uuid,
}

impl JobKey {
    pub fn new(queue: impl Into<String>, job_id: impl Into<String>, dispatch_id: Uuid) -> Self {
        Self {
            queue: queue.into(),
            job_id: job_id.into(),
            dispatch_id,
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.queue, self.job_id, self.dispatch_id)
    }
}

/// Durable, producer-visible status of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusInfo {
    pub job_id: String,
    pub dispatch_id: Uuid,
    pub queue: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Stream offset of the originating `job:process` record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl JobStatusInfo {
    /// Fresh pending record for a new dispatch.
    pub fn pending(key: &JobKey) -> Self {
        Self {
            job_id: key.job_id.clone(),
            dispatch_id: key.dispatch_id,
            queue: key.queue.clone(),
            status: JobStatus::Pending,
            error: None,
            retries: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            updated_at: None,
            message_id: None,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.queue.clone(), self.job_id.clone(), self.dispatch_id)
    }

    /// Fold a worker report into the record.
    ///
    /// Fields absent from the report keep their stored values. Completion
    /// clears the error of earlier attempts.
    pub fn apply(&mut self, event: &StatusEvent) {
        let now = Utc::now();
        if event.status == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.status = event.status;
        if event.status == JobStatus::Completed {
            self.error = None;
        } else if event.error.is_some() {
            self.error = event.error.clone();
        }
        if let Some(retries) = event.retries {
            self.retries = retries;
        }
        if event.completed_at.is_some() {
            self.completed_at = event.completed_at;
        } else if event.status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        self.updated_at = Some(now);
    }

    /// The status event describing this record.
    pub fn to_event(&self) -> StatusEvent {
        StatusEvent {
            job_id: self.job_id.clone(),
            dispatch_id: self.dispatch_id,
            queue: self.queue.clone(),
            status: self.status,
            error: self.error.clone(),
            retries: Some(self.retries),
            completed_at: self.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_keeps_absent_fields() {
        let key = JobKey::new("q", "a", Uuid::new_v4());
        let mut info = JobStatusInfo::pending(&key);
        info.error = Some("first".into());

        info.apply(&StatusEvent {
            job_id: "a".into(),
            dispatch_id: key.dispatch_id,
            queue: "q".into(),
            status: JobStatus::Running,
            error: None,
            retries: None,
            completed_at: None,
        });

        assert_eq!(info.status, JobStatus::Running);
        assert_eq!(info.error.as_deref(), Some("first"));
        assert!(info.started_at.is_some());
        assert!(info.updated_at.is_some());
        assert!(info.completed_at.is_none());
    }

    #[test]
    fn test_apply_terminal_stamps_completion() {
        let key = JobKey::new("q", "a", Uuid::new_v4());
        let mut info = JobStatusInfo::pending(&key);
        let mut event = info.to_event();
        event.status = JobStatus::Failed;
        event.error = Some("boom".into());
        event.retries = Some(2);

        info.apply(&event);
        assert_eq!(info.status, JobStatus::Failed);
        assert_eq!(info.retries, 2);
        assert!(info.completed_at.is_some());
    }

    #[test]
    fn test_completion_after_retry_clears_error() {
        let key = JobKey::new("q", "a", Uuid::new_v4());
        let mut info = JobStatusInfo::pending(&key);
        let mut event = info.to_event();
        event.status = JobStatus::ScheduledForRetry;
        event.error = Some("timeout".into());
        event.retries = Some(1);
        info.apply(&event);
        assert_eq!(info.error.as_deref(), Some("timeout"));

        event.status = JobStatus::Completed;
        event.error = None;
        info.apply(&event);
        assert_eq!(info.status, JobStatus::Completed);
        assert!(info.error.is_none());
        assert_eq!(info.retries, 1);
    }

    #[test]
    fn test_json_shape() {
        let key = JobKey::new("emails", "mail-1", Uuid::new_v4());
        let json = serde_json::to_value(JobStatusInfo::pending(&key)).unwrap();
        assert_eq!(json["jobId"], "mail-1");
        assert_eq!(json["status"], "pending");
        assert!(json.get("messageId").is_none());
    }

    #[test]
    fn test_key_display() {
        let d = Uuid::nil();
        assert_eq!(
            JobKey::new("q", "a", d).to_string(),
            "q:a:00000000-0000-0000-0000-000000000000"
        );
    }
}
