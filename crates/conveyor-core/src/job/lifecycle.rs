use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ConveyorError, Result};

use super::context::JobContext;
use super::traits::{JobStatus, DEFAULT_QUEUE};

/// A job instance with a status state machine.
///
/// Cloning is cheap and yields another handle to the same instance: the worker
/// keeps one handle in its bookkeeping while the executing task holds another,
/// so a cancel issued mid-run is visible to both.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

struct JobInner {
    id: String,
    dispatch_id: Uuid,
    name: String,
    args: serde_json::Value,
    created_at: DateTime<Utc>,
    cancellation: CancellationToken,
    state: Mutex<Lifecycle>,
}

#[derive(Debug, Clone)]
struct Lifecycle {
    status: JobStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    retries: u32,
    queue_name: String,
}

/// Point-in-time copy of a job's fields.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub id: String,
    pub dispatch_id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retries: u32,
    pub queue_name: String,
}

/// Builder for [`Job`] with optional identity overrides.
#[derive(Debug, Clone)]
pub struct JobBuilder {
    name: String,
    args: serde_json::Value,
    id: Option<String>,
    dispatch_id: Option<Uuid>,
    queue: Option<String>,
    retries: u32,
    created_at: Option<DateTime<Utc>>,
}

impl JobBuilder {
    /// Set job arguments.
    pub fn args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    /// Override the stable job id.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Override the dispatch id.
    pub fn dispatch_id(mut self, dispatch_id: Uuid) -> Self {
        self.dispatch_id = Some(dispatch_id);
        self
    }

    /// Set the queue name.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Carry over a retry count (redelivered jobs).
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Override the creation time.
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn build(self) -> Job {
        Job {
            inner: Arc::new(JobInner {
                id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                dispatch_id: self.dispatch_id.unwrap_or_else(Uuid::new_v4),
                name: self.name,
                args: self.args,
                created_at: self.created_at.unwrap_or_else(Utc::now),
                cancellation: CancellationToken::new(),
                state: Mutex::new(Lifecycle {
                    status: JobStatus::Pending,
                    started_at: None,
                    completed_at: None,
                    last_error: None,
                    retries: self.retries,
                    queue_name: self.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
                }),
            }),
        }
    }
}

impl Job {
    /// Start building a job of the given type.
    pub fn builder(name: impl Into<String>) -> JobBuilder {
        JobBuilder {
            name: name.into(),
            args: serde_json::Value::Null,
            id: None,
            dispatch_id: None,
            queue: None,
            retries: 0,
            created_at: None,
        }
    }

    /// Create a job with generated identity.
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self::builder(name).args(args).build()
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn dispatch_id(&self) -> Uuid {
        self.inner.dispatch_id
    }

    /// Job type name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn args(&self) -> &serde_json::Value {
        &self.inner.args
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn status(&self) -> JobStatus {
        self.state().status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state().started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.state().completed_at
    }

    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    pub fn retries(&self) -> u32 {
        self.state().retries
    }

    pub fn queue_name(&self) -> String {
        self.state().queue_name.clone()
    }

    /// Whether two handles refer to the same instance.
    pub fn same_instance(&self, other: &Job) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Copy all fields at once.
    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.state();
        JobSnapshot {
            id: self.inner.id.clone(),
            dispatch_id: self.inner.dispatch_id,
            name: self.inner.name.clone(),
            status: state.status,
            created_at: self.inner.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
            last_error: state.last_error.clone(),
            retries: state.retries,
            queue_name: state.queue_name.clone(),
        }
    }

    /// Build the context handed to the execute hook.
    pub fn context(&self, max_retries: u32) -> JobContext {
        let state = self.state();
        JobContext::new(
            self.inner.id.clone(),
            self.inner.dispatch_id,
            self.inner.name.clone(),
            state.queue_name.clone(),
            state.retries + 1,
            max_retries,
            self.inner.cancellation.clone(),
        )
    }

    /// Run the job through `execute`.
    ///
    /// Errors and panics raised by `execute` are caught and recorded via
    /// [`Job::fail`]; they never escape. Returns the status after the run.
    pub async fn run<F, Fut>(&self, max_retries: u32, execute: F) -> JobStatus
    where
        F: FnOnce(JobContext) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        {
            let mut state = self.state();
            if state.status == JobStatus::Cancelled {
                return JobStatus::Cancelled;
            }
            if !state.status.can_transition_to(JobStatus::Running) {
                return state.status;
            }
            state.status = JobStatus::Running;
            state.started_at = Some(Utc::now());
        }

        let ctx = self.context(max_retries);
        let outcome = AssertUnwindSafe(execute(ctx)).catch_unwind().await;

        match outcome {
            Ok(Ok(())) => {
                let mut state = self.state();
                // A cancel that landed mid-run keeps its status.
                if state.status == JobStatus::Running {
                    state.status = JobStatus::Completed;
                    state.completed_at.get_or_insert_with(Utc::now);
                }
            }
            Ok(Err(e)) => {
                let message = match e {
                    ConveyorError::Execution(message) => message,
                    other => other.to_string(),
                };
                self.fail(message);
            }
            Err(panic) => {
                self.fail(format!("job panicked: {}", panic_message(panic.as_ref())));
            }
        }

        self.status()
    }

    /// Mark the job failed. Has no effect on cancelled or completed jobs.
    pub fn fail(&self, error: impl Into<String>) -> bool {
        let mut state = self.state();
        if !state.status.can_transition_to(JobStatus::Failed) {
            return false;
        }
        state.status = JobStatus::Failed;
        state.last_error = Some(error.into());
        state.completed_at.get_or_insert_with(Utc::now);
        true
    }

    /// Cancel the job.
    ///
    /// Returns `false` when the job already finished or was already cancelled.
    /// An in-flight execution keeps running; it can observe the cancellation
    /// through [`JobContext::is_cancelled`].
    pub fn cancel(&self) -> bool {
        let mut state = self.state();
        if !state.status.can_transition_to(JobStatus::Cancelled) {
            return false;
        }
        let was_running = state.status == JobStatus::Running;
        state.status = JobStatus::Cancelled;
        if was_running {
            state.completed_at.get_or_insert_with(Utc::now);
        }
        drop(state);

        self.inner.cancellation.cancel();
        true
    }

    /// Bump the retry counter. Only the owning worker calls this.
    pub fn increment_retries(&self) -> u32 {
        let mut state = self.state();
        state.retries += 1;
        state.retries
    }

    /// Move a failed job into retry limbo and count the retry.
    ///
    /// The failed attempt was not the job's final outcome, so the attempt
    /// timestamps are cleared for the next run.
    pub fn schedule_retry(&self) -> Result<u32> {
        let mut state = self.state();
        if !state.status.can_transition_to(JobStatus::ScheduledForRetry) {
            return Err(ConveyorError::InvalidState(format!(
                "cannot retry job {} from status {}",
                self.inner.id, state.status
            )));
        }
        state.status = JobStatus::ScheduledForRetry;
        state.started_at = None;
        state.completed_at = None;
        state.retries += 1;
        Ok(state.retries)
    }

    /// Return a job in retry limbo to pending.
    pub fn requeue(&self) -> bool {
        let mut state = self.state();
        if !state.status.can_transition_to(JobStatus::Pending) {
            return false;
        }
        state.status = JobStatus::Pending;
        true
    }

    /// Record which queue owns the job.
    pub fn set_queue_name(&self, queue: impl Into<String>) {
        self.state().queue_name = queue.into();
    }

    fn state(&self) -> MutexGuard<'_, Lifecycle> {
        // Lifecycle updates never panic mid-way, so a poisoned lock still holds consistent data.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("dispatch_id", &self.inner.dispatch_id)
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
