use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::Result;

use super::context::JobContext;

/// Queue used when a job type does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Trait for Conveyor job handlers.
///
/// This is the whole contract the engine imposes on user code: a stable
/// logical name (via [`JobMetadata::name`]), an id factory and an execute hook.
pub trait ConveyorJob: Send + Sync + 'static {
    /// Input arguments type.
    type Args: DeserializeOwned + Serialize + Send + Sync + 'static;

    /// Get job metadata.
    fn metadata() -> JobMetadata;

    /// Build the stable job id for a submission.
    ///
    /// Jobs that must not overlap usually derive the id from their arguments
    /// so that every dispatch for the same entity shares one id.
    fn generate_job_id(_args: &Self::Args) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Execute the job.
    fn execute(
        ctx: &JobContext,
        args: Self::Args,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Job metadata, registered once per job type.
#[derive(Debug, Clone)]
pub struct JobMetadata {
    /// Job name (used for routing).
    pub name: &'static str,
    /// Target queue.
    pub queue: &'static str,
    /// Priority; lower values run first.
    pub priority: i32,
    /// Whether instances sharing a job id may run concurrently.
    pub overlap: OverlapBehavior,
    /// Delay before releasing the overlap lock after a run.
    pub overlap_delay: Option<Duration>,
    /// Retry limit overriding the queue default.
    pub max_retries: Option<u32>,
    /// Retry delay overriding the queue default.
    pub retry_delay: Option<Duration>,
}

impl Default for JobMetadata {
    fn default() -> Self {
        Self {
            name: "",
            queue: DEFAULT_QUEUE,
            priority: 0,
            overlap: OverlapBehavior::AllowOverlap,
            overlap_delay: None,
            max_retries: None,
            retry_delay: None,
        }
    }
}

/// Overlap policy for jobs sharing an id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverlapBehavior {
    /// Instances run concurrently, bounded only by queue concurrency.
    #[default]
    AllowOverlap,
    /// At most one instance per id runs at a time, cluster-wide.
    NoOverlap,
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to run.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Execution failed.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
    /// Failed and waiting for its retry timer.
    ScheduledForRetry,
}

impl JobStatus {
    /// Convert to wire/database string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::ScheduledForRetry => "scheduled_for_retry",
        }
    }

    /// Parse from wire/database string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "scheduled_for_retry" => Some(Self::ScheduledForRetry),
            _ => None,
        }
    }

    /// Whether the status ends a job instance's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine has an edge from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, ScheduledForRetry)
                | (ScheduledForRetry, Pending)
                | (ScheduledForRetry, Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
