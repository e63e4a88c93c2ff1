use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Context available to job handlers.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Stable job ID.
    pub job_id: String,
    /// ID of this particular submission.
    pub dispatch_id: Uuid,
    /// Job type/name.
    pub job_type: String,
    /// Queue the job runs on.
    pub queue: String,
    /// Current attempt number (1-based).
    pub attempt: u32,
    /// Maximum retries allowed after the first attempt.
    pub max_retries: u32,
    cancellation: CancellationToken,
}

impl JobContext {
    /// Create a new job context.
    pub fn new(
        job_id: impl Into<String>,
        dispatch_id: Uuid,
        job_type: impl Into<String>,
        queue: impl Into<String>,
        attempt: u32,
        max_retries: u32,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            dispatch_id,
            job_type: job_type.into(),
            queue: queue.into(),
            attempt,
            max_retries,
            cancellation,
        }
    }

    /// Check if this is a retry attempt.
    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }

    /// Check if this is the last attempt.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt > self.max_retries
    }

    /// Whether the job has been cancelled while running.
    ///
    /// Cancellation never interrupts the handler; long-running handlers
    /// should check this and return early.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the job is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}
