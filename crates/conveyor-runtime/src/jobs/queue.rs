use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use conveyor_core::job::{ConveyorJob, DispatchOptions, JobMetadata, JobStatus};
use conveyor_core::transport::{
    CancelEvent, JobKey, JobStatusInfo, ProcessEvent, Transport, TransportEvent,
    TransportNotification,
};
use conveyor_core::{ConveyorError, Result};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::registry::JobRegistry;

/// Identity of a dispatched job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReceipt {
    pub job_id: String,
    pub dispatch_id: Uuid,
    /// Stream offset assigned by the broker.
    pub message_id: Option<String>,
}

/// Producer-side handle to a named queue.
#[derive(Clone)]
pub struct Queue {
    name: String,
    transport: Arc<dyn Transport>,
    registry: Arc<JobRegistry>,
}

impl Queue {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        registry: Arc<JobRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            registry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connect the underlying transport.
    pub async fn start(&self) -> Result<()> {
        if self.transport.is_connected() {
            return Ok(());
        }
        self.transport.connect().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.transport.disconnect().await
    }

    /// Dispatch a job of type `J`.
    ///
    /// The job id comes from `options` or from `J::generate_job_id`.
    pub async fn dispatch<J: ConveyorJob>(
        &self,
        args: J::Args,
        options: DispatchOptions,
    ) -> Result<DispatchReceipt> {
        let metadata = J::metadata();
        let job_id = match &options.job_id {
            Some(id) => id.clone(),
            None => J::generate_job_id(&args),
        };
        let args = serde_json::to_value(args)?;
        self.send_process(&metadata, args, job_id, &options).await
    }

    /// Dispatch a registered job type by name.
    pub async fn dispatch_by_name(
        &self,
        job: &str,
        args: Value,
        options: DispatchOptions,
    ) -> Result<DispatchReceipt> {
        let entry = self.registry.get(job)?;
        let job_id = match &options.job_id {
            Some(id) => id.clone(),
            None => entry.generate_job_id(&args)?,
        };
        self.send_process(&entry.metadata, args, job_id, &options)
            .await
    }

    async fn send_process(
        &self,
        metadata: &JobMetadata,
        args: Value,
        job_id: String,
        options: &DispatchOptions,
    ) -> Result<DispatchReceipt> {
        if let Some(other) = options.queue.as_deref().filter(|q| *q != self.name) {
            return Err(ConveyorError::InvalidArgument(format!(
                "queue handle '{}' cannot dispatch to '{}'; use QueueRegistry::queue(\"{}\")",
                self.name, other, other
            )));
        }

        let event = ProcessEvent {
            job: metadata.name.to_string(),
            args,
            job_id: job_id.clone(),
            dispatch_id: options.dispatch_id.unwrap_or_else(Uuid::new_v4),
            queue: self.name.clone(),
            options: options.resolve(metadata),
        };
        let dispatch_id = event.dispatch_id;
        let queue = event.queue.clone();

        let message_id = self
            .transport
            .send(TransportEvent::JobProcess(event))
            .await
            .map_err(|e| ConveyorError::Dispatch(e.to_string()))?;

        tracing::debug!(
            job = metadata.name,
            job_id = %job_id,
            dispatch_id = %dispatch_id,
            queue = %queue,
            "Job dispatched"
        );

        Ok(DispatchReceipt {
            job_id,
            dispatch_id,
            message_id,
        })
    }

    /// Ask workers to cancel a job. Returns `false` if the request could not
    /// be sent.
    pub async fn cancel_job(&self, job_id: &str, dispatch_id: Option<Uuid>) -> bool {
        self.send_cancel(CancelEvent {
            job_id: Some(job_id.to_string()),
            dispatch_id,
            queue: self.name.clone(),
        })
        .await
    }

    /// Ask workers to cancel everything in this queue.
    pub async fn cancel_all_jobs(&self) -> bool {
        self.send_cancel(CancelEvent {
            job_id: None,
            dispatch_id: None,
            queue: self.name.clone(),
        })
        .await
    }

    async fn send_cancel(&self, event: CancelEvent) -> bool {
        match self.transport.send(TransportEvent::JobCancel(event)).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(queue = %self.name, "Failed to send cancel request: {}", e);
                false
            }
        }
    }

    /// Stored status of a dispatch, or of the most recent dispatch of the
    /// job id when `dispatch_id` is `None`. Any failure yields `None`.
    pub async fn get_job_status(
        &self,
        job_id: &str,
        dispatch_id: Option<Uuid>,
    ) -> Option<JobStatusInfo> {
        let result = match dispatch_id {
            Some(dispatch_id) => {
                self.transport
                    .get_job_status(&JobKey::new(self.name.clone(), job_id, dispatch_id))
                    .await
            }
            None => self
                .transport
                .find_job_statuses(&self.name, job_id)
                .await
                .map(|found| found.into_iter().next()),
        };

        match result {
            Ok(info) => info,
            Err(e) => {
                tracing::debug!(queue = %self.name, job_id = %job_id, "Status lookup failed: {}", e);
                None
            }
        }
    }

    /// Dispatches in this queue with the given status.
    pub async fn list_jobs(&self, status: JobStatus, limit: usize) -> Result<Vec<JobStatusInfo>> {
        self.transport.list_jobs(&self.name, status, limit).await
    }

    /// Transport notifications: status changes, lock releases, membership.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportNotification> {
        self.transport.subscribe()
    }

    /// Wait until a dispatch reaches a terminal status.
    pub async fn wait_for(
        &self,
        job_id: &str,
        dispatch_id: Uuid,
        timeout: Duration,
    ) -> Result<JobStatusInfo> {
        let key = JobKey::new(self.name.clone(), job_id, dispatch_id);
        let mut notifications = self.subscribe();

        let wait = async {
            if let Some(info) = self.terminal_status(&key).await? {
                return Ok(info);
            }
            loop {
                match notifications.recv().await {
                    Ok(TransportNotification::StatusChanged(info))
                        if info.key() == key && info.status.is_terminal() =>
                    {
                        return Ok(info);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(info) = self.terminal_status(&key).await? {
                            return Ok(info);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(ConveyorError::Transport(
                            "notification channel closed".to_string(),
                        ));
                    }
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            ConveyorError::Timeout(format!("job {} did not finish within {:?}", key, timeout))
        })?
    }

    async fn terminal_status(&self, key: &JobKey) -> Result<Option<JobStatusInfo>> {
        Ok(self
            .transport
            .get_job_status(key)
            .await?
            .filter(|info| info.status.is_terminal()))
    }
}

/// Queue handles keyed by name, created on first use.
pub struct QueueRegistry {
    transport: Arc<dyn Transport>,
    registry: Arc<JobRegistry>,
    queues: Mutex<HashMap<String, Queue>>,
}

impl QueueRegistry {
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<JobRegistry>) -> Self {
        Self {
            transport,
            registry,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// The queue with this name, created if absent.
    pub fn queue(&self, name: &str) -> Queue {
        self.queues()
            .entry(name.to_string())
            .or_insert_with(|| Queue::new(name, self.transport.clone(), self.registry.clone()))
            .clone()
    }

    /// The queue a job type routes to by default.
    pub fn queue_for<J: ConveyorJob>(&self) -> Queue {
        self.queue(J::metadata().queue)
    }

    pub fn get(&self, name: &str) -> Option<Queue> {
        self.queues().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, Queue>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
