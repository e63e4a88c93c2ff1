//! Payloads carried over `pg_notify`.

use conveyor_core::transport::{
    CancelEvent, JobStatusInfo, TransportEvent, TransportNotification, WorkerEvent,
};
use conveyor_core::Result;
use serde::{Deserialize, Serialize};

/// Postgres caps NOTIFY payloads at 8000 bytes.
const MAX_ERROR_LEN: usize = 2000;

/// A broker-wide signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Signal {
    /// A record was appended. Carries only the stream offset.
    NewMessage { queue: String, offset: i64 },
    Cancel(CancelEvent),
    Status(JobStatusInfo),
    LockReleased { queue: String, job_id: String },
    WorkerRegister(WorkerEvent),
    WorkerUnregister(WorkerEvent),
}

impl Signal {
    /// Build the signal for a status record, trimming long errors to fit a payload.
    pub fn status(info: &JobStatusInfo) -> Self {
        let mut info = info.clone();
        if let Some(error) = &info.error {
            if error.len() > MAX_ERROR_LEN {
                let mut end = MAX_ERROR_LEN;
                while !error.is_char_boundary(end) {
                    end -= 1;
                }
                info.error = Some(format!("{}...", &error[..end]));
            }
        }
        Signal::Status(info)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// The notification subscribers see for this signal, if any.
    pub fn notification(&self) -> Option<TransportNotification> {
        match self {
            Signal::Status(info) => Some(TransportNotification::StatusChanged(info.clone())),
            Signal::LockReleased { queue, job_id } => Some(TransportNotification::LockReleased {
                queue: queue.clone(),
                job_id: job_id.clone(),
            }),
            Signal::WorkerRegister(event) => Some(TransportNotification::Membership(
                TransportEvent::WorkerRegister(event.clone()),
            )),
            Signal::WorkerUnregister(event) => Some(TransportNotification::Membership(
                TransportEvent::WorkerUnregister(event.clone()),
            )),
            Signal::NewMessage { .. } | Signal::Cancel(_) => None,
        }
    }
}

/// Channel name for a prefix.
pub fn channel_name(prefix: &str) -> String {
    format!("{}_signals", prefix)
}
