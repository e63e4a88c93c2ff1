use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConveyorError, Result};
use crate::job::{JobOptions, JobStatus};

/// Wildcard job id in a cancel event: every job of the queue.
pub const CANCEL_ALL: &str = "*";

/// Flat field map stored per broker record.
pub type WireRecord = BTreeMap<String, String>;

/// A job submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessEvent {
    /// Registered job type name.
    pub job: String,
    pub args: serde_json::Value,
    pub job_id: String,
    pub dispatch_id: Uuid,
    pub queue: String,
    pub options: JobOptions,
}

/// Cancellation request for one dispatch, every dispatch of an id, or a whole queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelEvent {
    /// `None` targets every job in the queue.
    pub job_id: Option<String>,
    /// `None` targets every dispatch of `job_id`.
    pub dispatch_id: Option<Uuid>,
    pub queue: String,
}

impl CancelEvent {
    /// Whether the event targets the given dispatch.
    pub fn matches(&self, queue: &str, job_id: &str, dispatch_id: Uuid) -> bool {
        if self.queue != queue {
            return false;
        }
        match (&self.job_id, self.dispatch_id) {
            (None, _) => true,
            (Some(id), None) => id == job_id,
            (Some(id), Some(d)) => id == job_id && d == dispatch_id,
        }
    }
}

/// Status report published by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub job_id: String,
    pub dispatch_id: Uuid,
    pub queue: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub retries: Option<u32>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Worker membership announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerEvent {
    pub worker_id: String,
    pub queues: Vec<String>,
}

/// Events moved by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    JobProcess(ProcessEvent),
    JobCancel(CancelEvent),
    JobStatus(StatusEvent),
    /// Terminal status report.
    JobResult(StatusEvent),
    WorkerRegister(WorkerEvent),
    WorkerUnregister(WorkerEvent),
}

impl TransportEvent {
    /// Wire type tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::JobProcess(_) => "job:process",
            Self::JobCancel(_) => "job:cancel",
            Self::JobStatus(_) => "job:status",
            Self::JobResult(_) => "job:result",
            Self::WorkerRegister(_) => "worker:register",
            Self::WorkerUnregister(_) => "worker:unregister",
        }
    }

    /// Queue the event concerns, if any.
    pub fn queue(&self) -> Option<&str> {
        match self {
            Self::JobProcess(e) => Some(&e.queue),
            Self::JobCancel(e) => Some(&e.queue),
            Self::JobStatus(e) | Self::JobResult(e) => Some(&e.queue),
            Self::WorkerRegister(_) | Self::WorkerUnregister(_) => None,
        }
    }

    /// Build the status event for a worker report, tagged as a result when terminal.
    pub fn status(event: StatusEvent) -> Self {
        if event.status.is_terminal() {
            Self::JobResult(event)
        } else {
            Self::JobStatus(event)
        }
    }

    /// Flatten into the broker record field set.
    pub fn to_record(&self) -> Result<WireRecord> {
        let mut record = WireRecord::new();
        record.insert("type".into(), self.event_type().into());

        match self {
            Self::JobProcess(e) => {
                record.insert("job".into(), e.job.clone());
                record.insert("args".into(), serde_json::to_string(&e.args)?);
                record.insert("jobId".into(), e.job_id.clone());
                record.insert("dispatchId".into(), e.dispatch_id.to_string());
                record.insert("queue".into(), e.queue.clone());
                record.insert("options".into(), serde_json::to_string(&e.options)?);
            }
            Self::JobCancel(e) => {
                record.insert(
                    "jobId".into(),
                    e.job_id.clone().unwrap_or_else(|| CANCEL_ALL.to_string()),
                );
                record.insert(
                    "dispatchId".into(),
                    e.dispatch_id.map(|d| d.to_string()).unwrap_or_default(),
                );
                record.insert("queue".into(), e.queue.clone());
            }
            Self::JobStatus(e) | Self::JobResult(e) => {
                record.insert("jobId".into(), e.job_id.clone());
                record.insert("dispatchId".into(), e.dispatch_id.to_string());
                record.insert("queue".into(), e.queue.clone());
                record.insert("status".into(), e.status.as_str().into());
                if let Some(ref error) = e.error {
                    record.insert("error".into(), error.clone());
                }
                if let Some(retries) = e.retries {
                    record.insert("retries".into(), retries.to_string());
                }
                if let Some(at) = e.completed_at {
                    record.insert("completedAt".into(), at.to_rfc3339());
                }
            }
            Self::WorkerRegister(e) | Self::WorkerUnregister(e) => {
                record.insert("workerId".into(), e.worker_id.clone());
                record.insert("queues".into(), serde_json::to_string(&e.queues)?);
            }
        }

        Ok(record)
    }

    /// Parse a broker record.
    pub fn from_record(record: &WireRecord) -> Result<Self> {
        let kind = field(record, "type")?;
        match kind {
            "job:process" => Ok(Self::JobProcess(ProcessEvent {
                job: field(record, "job")?.to_string(),
                args: serde_json::from_str(field(record, "args")?)?,
                job_id: field(record, "jobId")?.to_string(),
                dispatch_id: parse_uuid(field(record, "dispatchId")?)?,
                queue: field(record, "queue")?.to_string(),
                options: serde_json::from_str(field(record, "options")?)?,
            })),
            "job:cancel" => {
                let job_id = field(record, "jobId")?;
                let dispatch_id = record.get("dispatchId").map(String::as_str).unwrap_or("");
                Ok(Self::JobCancel(CancelEvent {
                    job_id: (job_id != CANCEL_ALL).then(|| job_id.to_string()),
                    dispatch_id: if dispatch_id.is_empty() {
                        None
                    } else {
                        Some(parse_uuid(dispatch_id)?)
                    },
                    queue: field(record, "queue")?.to_string(),
                }))
            }
            "job:status" | "job:result" => {
                let status_str = field(record, "status")?;
                let status = JobStatus::from_str(status_str).ok_or_else(|| {
                    ConveyorError::Serialization(format!("unknown status '{}'", status_str))
                })?;
                let retries = match record.get("retries") {
                    Some(r) => Some(r.parse::<u32>().map_err(|e| {
                        ConveyorError::Serialization(format!("invalid retries '{}': {}", r, e))
                    })?),
                    None => None,
                };
                let completed_at = match record.get("completedAt") {
                    Some(at) => Some(
                        DateTime::parse_from_rfc3339(at)
                            .map_err(|e| ConveyorError::Serialization(e.to_string()))?
                            .with_timezone(&Utc),
                    ),
                    None => None,
                };
                let event = StatusEvent {
                    job_id: field(record, "jobId")?.to_string(),
                    dispatch_id: parse_uuid(field(record, "dispatchId")?)?,
                    queue: field(record, "queue")?.to_string(),
                    status,
                    error: record.get("error").cloned(),
                    retries,
                    completed_at,
                };
                Ok(if kind == "job:result" {
                    Self::JobResult(event)
                } else {
                    Self::JobStatus(event)
                })
            }
            "worker:register" | "worker:unregister" => {
                let event = WorkerEvent {
                    worker_id: field(record, "workerId")?.to_string(),
                    queues: serde_json::from_str(field(record, "queues")?)?,
                };
                Ok(if kind == "worker:register" {
                    Self::WorkerRegister(event)
                } else {
                    Self::WorkerUnregister(event)
                })
            }
            other => Err(ConveyorError::Serialization(format!(
                "unknown event type '{}'",
                other
            ))),
        }
    }
}

fn field<'a>(record: &'a WireRecord, name: &str) -> Result<&'a str> {
    record
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| ConveyorError::Serialization(format!("missing field '{}'", name)))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| ConveyorError::Serialization(format!("invalid id '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::OverlapBehavior;

    #[test]
    fn test_process_record_fields() {
        let event = TransportEvent::JobProcess(ProcessEvent {
            job: "send_email".into(),
            args: serde_json::json!({"to": "a@example.com"}),
            job_id: "mail-1".into(),
            dispatch_id: Uuid::new_v4(),
            queue: "emails".into(),
            options: JobOptions {
                priority: Some(3),
                overlap: Some(OverlapBehavior::NoOverlap),
                ..Default::default()
            },
        });

        let record = event.to_record().unwrap();
        let keys: Vec<&str> = record.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["args", "dispatchId", "job", "jobId", "options", "queue", "type"]
        );
        assert_eq!(record["type"], "job:process");
        assert_eq!(record["args"], r#"{"to":"a@example.com"}"#);

        assert_eq!(TransportEvent::from_record(&record).unwrap(), event);
    }

    #[test]
    fn test_cancel_all_wire_form() {
        let event = TransportEvent::JobCancel(CancelEvent {
            job_id: None,
            dispatch_id: None,
            queue: "emails".into(),
        });
        let record = event.to_record().unwrap();
        assert_eq!(record["jobId"], CANCEL_ALL);
        assert_eq!(record["dispatchId"], "");
        assert_eq!(TransportEvent::from_record(&record).unwrap(), event);
    }

    #[test]
    fn test_status_helper_tags_terminal_as_result() {
        let event = StatusEvent {
            job_id: "a".into(),
            dispatch_id: Uuid::new_v4(),
            queue: "q".into(),
            status: JobStatus::Failed,
            error: Some("boom".into()),
            retries: Some(2),
            completed_at: Some(Utc::now()),
        };
        let wrapped = TransportEvent::status(event.clone());
        assert_eq!(wrapped.event_type(), "job:result");

        let running = TransportEvent::status(StatusEvent {
            status: JobStatus::Running,
            ..event
        });
        assert_eq!(running.event_type(), "job:status");
    }

    #[test]
    fn test_cancel_matching() {
        let d = Uuid::new_v4();
        let all = CancelEvent {
            job_id: None,
            dispatch_id: None,
            queue: "q".into(),
        };
        assert!(all.matches("q", "anything", d));
        assert!(!all.matches("other", "anything", d));

        let by_id = CancelEvent {
            job_id: Some("a".into()),
            dispatch_id: None,
            queue: "q".into(),
        };
        assert!(by_id.matches("q", "a", d));
        assert!(!by_id.matches("q", "b", d));

        let exact = CancelEvent {
            job_id: Some("a".into()),
            dispatch_id: Some(d),
            queue: "q".into(),
        };
        assert!(exact.matches("q", "a", d));
        assert!(!exact.matches("q", "a", Uuid::new_v4()));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut record = WireRecord::new();
        record.insert("type".into(), "job:explode".into());
        assert!(TransportEvent::from_record(&record).is_err());
    }

    #[test]
    fn test_missing_field_rejected() {
        let mut record = WireRecord::new();
        record.insert("type".into(), "job:status".into());
        record.insert("jobId".into(), "a".into());
        let err = TransportEvent::from_record(&record).unwrap_err();
        assert!(err.to_string().contains("dispatchId"));
    }
}
