//! Broker protocol between producers and workers.

mod event;
mod status;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::broadcast;

use crate::cluster::WorkerRegistration;
use crate::error::Result;

pub use event::{
    CancelEvent, ProcessEvent, StatusEvent, TransportEvent, WireRecord, WorkerEvent, CANCEL_ALL,
};
pub use status::{JobKey, JobStatusInfo};

/// Handler invoked once per delivered event.
///
/// A delivery is acknowledged only after every registered handler returned,
/// so an event in flight when a process dies is delivered again.
pub type MessageHandler =
    Arc<dyn Fn(TransportEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Out-of-band notifications published by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportNotification {
    /// A status record was written.
    StatusChanged(JobStatusInfo),
    /// A NO_OVERLAP lock was released.
    LockReleased { queue: String, job_id: String },
    /// Worker membership changed.
    Membership(TransportEvent),
}

/// How a consumer attaches to the per-queue streams.
///
/// Every consumer belongs to one shared group: a record is delivered to a
/// single consumer and redelivered only if it is not acknowledged in time.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Consumer name, usually the worker id.
    pub consumer_id: String,
    pub queues: Vec<String>,
    /// Records claimed per read.
    pub batch_size: usize,
    /// Fallback poll period when no notification arrives.
    pub poll_interval: Duration,
}

impl ConsumerOptions {
    pub fn new(consumer_id: impl Into<String>, queues: Vec<String>) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            queues,
            batch_size: 16,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Retention applied by a maintenance pass.
#[derive(Debug, Clone, Copy)]
pub struct MaintenancePolicy {
    /// Acknowledged records kept per stream.
    pub stream_max_len: usize,
    /// Terminal status records older than this are purged.
    pub retention: Duration,
}

/// What a maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub trimmed_records: u64,
    pub purged_statuses: u64,
    pub expired_locks: u64,
    pub expired_workers: u64,
}

impl MaintenanceReport {
    pub fn total(&self) -> u64 {
        self.trimmed_records + self.purged_statuses + self.expired_locks + self.expired_workers
    }
}

/// A broker connection.
///
/// Implementations must make `acquire_job_lock` an atomic
/// set-if-absent-with-expiry: NO_OVERLAP correctness across processes rests
/// on it.
pub trait Transport: Send + Sync + 'static {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    fn connect(&self) -> BoxFuture<'_, Result<()>>;

    fn disconnect(&self) -> BoxFuture<'_, Result<()>>;

    fn is_connected(&self) -> bool;

    /// Publish an event.
    ///
    /// `job:process` is appended to the queue stream, indexed, recorded as
    /// pending and announced with its offset, which is returned.
    /// `job:cancel` is fanned out to every consumer. Status events are
    /// folded into the status record.
    fn send(&self, event: TransportEvent) -> BoxFuture<'_, Result<Option<String>>>;

    /// Register a delivery handler.
    fn on_message(&self, handler: MessageHandler);

    /// Start delivering events for the given queues to the registered handlers.
    fn consume(&self, options: ConsumerOptions) -> BoxFuture<'_, Result<()>>;

    /// Receive out-of-band notifications.
    fn subscribe(&self) -> broadcast::Receiver<TransportNotification>;

    fn get_job_status(&self, key: &JobKey) -> BoxFuture<'_, Result<Option<JobStatusInfo>>>;

    /// Every stored dispatch of a job id, most recently updated first.
    fn find_job_statuses(
        &self,
        queue: &str,
        job_id: &str,
    ) -> BoxFuture<'_, Result<Vec<JobStatusInfo>>>;

    /// Write a status record, re-index it and publish the change.
    fn update_job_status(&self, info: JobStatusInfo) -> BoxFuture<'_, Result<()>>;

    /// Dispatches of a queue in a status, ordered by priority then age.
    fn list_jobs(
        &self,
        queue: &str,
        status: crate::job::JobStatus,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<JobStatusInfo>>>;

    fn register_worker(
        &self,
        registration: WorkerRegistration,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<()>>;

    fn unregister_worker(&self, worker_id: &str) -> BoxFuture<'_, Result<()>>;

    /// Registrations whose TTL has not run out.
    fn list_workers(&self) -> BoxFuture<'_, Result<Vec<WorkerRegistration>>>;

    /// Take the lock for `(queue, job_id)` unless someone else holds it.
    fn acquire_job_lock(
        &self,
        queue: &str,
        job_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Drop the lock if `holder` owns it and publish `LockReleased`.
    fn release_job_lock(
        &self,
        queue: &str,
        job_id: &str,
        holder: &str,
    ) -> BoxFuture<'_, Result<bool>>;

    fn is_job_locked(&self, queue: &str, job_id: &str) -> BoxFuture<'_, Result<bool>>;

    /// Trim streams and purge expired records.
    fn run_maintenance(
        &self,
        policy: MaintenancePolicy,
    ) -> BoxFuture<'_, Result<MaintenanceReport>>;
}
