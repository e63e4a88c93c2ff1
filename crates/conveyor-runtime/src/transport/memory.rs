//! Process-local broker.
//!
//! Several [`MemoryTransport`]s sharing one [`MemoryBroker`] behave like
//! separate processes talking to one broker, which is how the worker tests
//! exercise cross-worker locking and redelivery.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::Utc;
use conveyor_core::cluster::WorkerRegistration;
use conveyor_core::job::JobStatus;
use conveyor_core::transport::{
    CancelEvent, ConsumerOptions, JobKey, JobStatusInfo, MaintenancePolicy, MaintenanceReport,
    MessageHandler, ProcessEvent, StatusEvent, Transport, TransportEvent, TransportNotification,
    WireRecord, WorkerEvent,
};
use conveyor_core::{ConveyorError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::deliver;

/// Broker timing knobs.
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    /// How long a delivered record stays claimed without an ack.
    pub visibility_timeout: Duration,
    /// Lifetime of a status record after its last write.
    pub status_ttl: Duration,
    /// Registration TTL used for `worker:register` events.
    pub registration_ttl: Duration,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            status_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            registration_ttl: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
enum Signal {
    NewMessage { queue: String, offset: u64 },
    Cancel(CancelEvent),
}

#[derive(Debug)]
struct StreamEntry {
    offset: u64,
    record: WireRecord,
    claim: Option<(String, Instant)>,
    acked: bool,
}

#[derive(Debug)]
struct StoredStatus {
    info: JobStatusInfo,
    priority: i32,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct BrokerState {
    next_offset: u64,
    streams: HashMap<String, VecDeque<StreamEntry>>,
    statuses: HashMap<JobKey, StoredStatus>,
    workers: HashMap<String, (WorkerRegistration, Instant)>,
    locks: HashMap<(String, String), (String, Instant)>,
}

/// Shared in-memory broker.
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    config: MemoryBrokerConfig,
    available: AtomicBool,
    signals: broadcast::Sender<Signal>,
    notifications: broadcast::Sender<TransportNotification>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Self::with_config(MemoryBrokerConfig::default())
    }

    pub fn with_config(config: MemoryBrokerConfig) -> Arc<Self> {
        let (signals, _) = broadcast::channel(1024);
        let (notifications, _) = broadcast::channel(1024);
        Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
            config,
            available: AtomicBool::new(true),
            signals,
            notifications,
        })
    }

    /// Simulate an outage: every call fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Records currently stored for a queue.
    pub fn stream_len(&self, queue: &str) -> usize {
        self.state().streams.get(queue).map_or(0, VecDeque::len)
    }

    /// Records of a queue not yet acknowledged.
    pub fn pending_count(&self, queue: &str) -> usize {
        self.state()
            .streams
            .get(queue)
            .map_or(0, |s| s.iter().filter(|e| !e.acked).count())
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(ConveyorError::Transport("broker unavailable".to_string()))
        }
    }

    fn publish(&self, notification: TransportNotification) {
        let _ = self.notifications.send(notification);
    }

    fn append(&self, event: &ProcessEvent, record: WireRecord) -> u64 {
        let key = JobKey::new(event.queue.clone(), event.job_id.clone(), event.dispatch_id);
        let (offset, info) = {
            let mut state = self.state();
            state.next_offset += 1;
            let offset = state.next_offset;
            state
                .streams
                .entry(event.queue.clone())
                .or_default()
                .push_back(StreamEntry {
                    offset,
                    record,
                    claim: None,
                    acked: false,
                });

            let mut info = JobStatusInfo::pending(&key);
            info.message_id = Some(offset.to_string());
            state.statuses.insert(
                key,
                StoredStatus {
                    info: info.clone(),
                    priority: event.options.priority(),
                    expires_at: Instant::now() + self.config.status_ttl,
                },
            );
            (offset, info)
        };

        let _ = self.signals.send(Signal::NewMessage {
            queue: event.queue.clone(),
            offset,
        });
        self.publish(TransportNotification::StatusChanged(info));
        offset
    }

    /// Drop undelivered records targeted by a cancel and fan it out.
    fn cancel(&self, event: &CancelEvent) {
        let cancelled = {
            let mut state = self.state();
            let mut keys = Vec::new();
            if let Some(stream) = state.streams.get_mut(&event.queue) {
                for entry in stream.iter_mut().filter(|e| !e.acked && e.claim.is_none()) {
                    let Some(key) = record_key(&entry.record) else {
                        continue;
                    };
                    if event.matches(&key.queue, &key.job_id, key.dispatch_id) {
                        entry.acked = true;
                        keys.push(key);
                    }
                }
            }

            let mut infos = Vec::new();
            for key in keys {
                if let Some(stored) = state.statuses.get_mut(&key) {
                    let event = StatusEvent {
                        status: JobStatus::Cancelled,
                        ..stored.info.to_event()
                    };
                    stored.info.apply(&event);
                    infos.push(stored.info.clone());
                }
            }
            infos
        };

        for info in cancelled {
            self.publish(TransportNotification::StatusChanged(info));
        }
        let _ = self.signals.send(Signal::Cancel(event.clone()));
    }

    fn claim(&self, queues: &[String], consumer: &str, limit: usize) -> Vec<(String, u64, WireRecord)> {
        let now = Instant::now();
        let visibility = self.config.visibility_timeout;
        let mut state = self.state();
        let mut claimed = Vec::new();

        for queue in queues {
            let Some(stream) = state.streams.get_mut(queue) else {
                continue;
            };
            for entry in stream.iter_mut().filter(|e| !e.acked) {
                if claimed.len() >= limit {
                    return claimed;
                }
                let claimable = match &entry.claim {
                    None => true,
                    Some((_, at)) => now.duration_since(*at) >= visibility,
                };
                if claimable {
                    entry.claim = Some((consumer.to_string(), now));
                    claimed.push((queue.clone(), entry.offset, entry.record.clone()));
                }
            }
        }
        claimed
    }

    fn ack(&self, queue: &str, offset: u64) {
        if let Some(stream) = self.state().streams.get_mut(queue) {
            if let Some(entry) = stream.iter_mut().find(|e| e.offset == offset) {
                entry.acked = true;
            }
        }
    }

    fn status(&self, key: &JobKey) -> Option<JobStatusInfo> {
        let now = Instant::now();
        self.state()
            .statuses
            .get(key)
            .filter(|s| s.expires_at > now)
            .map(|s| s.info.clone())
    }

    fn store_status(&self, info: JobStatusInfo) {
        {
            let mut state = self.state();
            let expires_at = Instant::now() + self.config.status_ttl;
            let priority = state
                .statuses
                .get(&info.key())
                .map_or(0, |existing| existing.priority);
            state.statuses.insert(
                info.key(),
                StoredStatus {
                    info: info.clone(),
                    priority,
                    expires_at,
                },
            );
        }
        self.publish(TransportNotification::StatusChanged(info));
    }

    fn apply_status(&self, event: &StatusEvent) {
        let key = JobKey::new(event.queue.clone(), event.job_id.clone(), event.dispatch_id);
        let mut info = self
            .status(&key)
            .unwrap_or_else(|| JobStatusInfo::pending(&key));
        info.apply(event);
        self.store_status(info);
    }

    fn register(&self, registration: WorkerRegistration, ttl: Duration) {
        let event = WorkerEvent {
            worker_id: registration.worker_id.clone(),
            queues: registration.queues.clone(),
        };
        self.state().workers.insert(
            registration.worker_id.clone(),
            (registration, Instant::now() + ttl),
        );
        self.publish(TransportNotification::Membership(
            TransportEvent::WorkerRegister(event),
        ));
    }

    fn unregister(&self, worker_id: &str) {
        let removed = self.state().workers.remove(worker_id);
        if let Some((registration, _)) = removed {
            self.publish(TransportNotification::Membership(
                TransportEvent::WorkerUnregister(WorkerEvent {
                    worker_id: registration.worker_id,
                    queues: registration.queues,
                }),
            ));
        }
    }

    fn acquire(&self, queue: &str, job_id: &str, holder: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut state = self.state();
        let key = (queue.to_string(), job_id.to_string());
        match state.locks.get(&key) {
            Some((_, expires_at)) if *expires_at > now => false,
            _ => {
                state.locks.insert(key, (holder.to_string(), now + ttl));
                true
            }
        }
    }

    fn release(&self, queue: &str, job_id: &str, holder: &str) -> bool {
        let released = {
            let mut state = self.state();
            let key = (queue.to_string(), job_id.to_string());
            match state.locks.get(&key) {
                Some((owner, _)) if owner == holder => {
                    state.locks.remove(&key);
                    true
                }
                _ => false,
            }
        };
        if released {
            self.publish(TransportNotification::LockReleased {
                queue: queue.to_string(),
                job_id: job_id.to_string(),
            });
        }
        released
    }

    fn is_locked(&self, queue: &str, job_id: &str) -> bool {
        let now = Instant::now();
        self.state()
            .locks
            .get(&(queue.to_string(), job_id.to_string()))
            .is_some_and(|(_, expires_at)| *expires_at > now)
    }

    fn maintain(&self, policy: MaintenancePolicy) -> MaintenanceReport {
        let now = Instant::now();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(policy.retention).unwrap_or(chrono::Duration::MAX);
        let mut state = self.state();
        let mut report = MaintenanceReport::default();

        for stream in state.streams.values_mut() {
            let acked = stream.iter().filter(|e| e.acked).count();
            let mut excess = acked.saturating_sub(policy.stream_max_len);
            report.trimmed_records += excess as u64;
            stream.retain(|e| {
                if e.acked && excess > 0 {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }

        let before = state.statuses.len();
        state.statuses.retain(|_, s| {
            let last_write = s.info.updated_at.unwrap_or(s.info.created_at);
            s.expires_at > now && !(s.info.status.is_terminal() && last_write < cutoff)
        });
        report.purged_statuses = (before - state.statuses.len()) as u64;

        let before = state.locks.len();
        state.locks.retain(|_, (_, expires_at)| *expires_at > now);
        report.expired_locks = (before - state.locks.len()) as u64;

        let before = state.workers.len();
        state.workers.retain(|_, (_, expires_at)| *expires_at > now);
        report.expired_workers = (before - state.workers.len()) as u64;

        report
    }
}

fn record_key(record: &WireRecord) -> Option<JobKey> {
    let dispatch_id = Uuid::parse_str(record.get("dispatchId")?).ok()?;
    Some(JobKey::new(
        record.get("queue")?.clone(),
        record.get("jobId")?.clone(),
        dispatch_id,
    ))
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
    handlers: Arc<RwLock<Vec<MessageHandler>>>,
    connected: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl MemoryTransport {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            broker,
            handlers: Arc::new(RwLock::new(Vec::new())),
            connected: AtomicBool::new(false),
            shutdown_tx,
            consumers: Mutex::new(Vec::new()),
        }
    }

    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }

    fn check(&self) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConveyorError::Transport("transport not connected".to_string()));
        }
        self.broker.check()
    }

    fn consumers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn consume_loop(
    broker: Arc<MemoryBroker>,
    handlers: Arc<RwLock<Vec<MessageHandler>>>,
    options: ConsumerOptions,
    mut signals: broadcast::Receiver<Signal>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if broker.is_available() {
            loop {
                let batch = broker.claim(&options.queues, &options.consumer_id, options.batch_size);
                if batch.is_empty() {
                    break;
                }
                for (queue, offset, record) in batch {
                    match TransportEvent::from_record(&record) {
                        Ok(event) => {
                            if deliver(&handlers, event).await {
                                broker.ack(&queue, offset);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(queue = %queue, offset, "Dropping malformed record: {}", e);
                            broker.ack(&queue, offset);
                        }
                    }
                }
            }
        }

        tokio::select! {
            signal = signals.recv() => match signal {
                Ok(Signal::Cancel(event)) if options.queues.contains(&event.queue) => {
                    deliver(&handlers, TransportEvent::JobCancel(event)).await;
                }
                Ok(Signal::NewMessage { queue, offset }) => {
                    tracing::trace!(queue = %queue, offset, "New stream record");
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Consumer lagged behind broker signals");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::time::sleep(options.poll_interval) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            self.broker.check()?;
            self.shutdown_tx.send_replace(false);
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }
        .boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            self.connected.store(false, Ordering::SeqCst);
            self.shutdown_tx.send_replace(true);
            let consumers: Vec<JoinHandle<()>> = self.consumers().drain(..).collect();
            for consumer in consumers {
                let _ = consumer.await;
            }
            Ok(())
        }
        .boxed()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, event: TransportEvent) -> BoxFuture<'_, Result<Option<String>>> {
        async move {
            self.check()?;
            match event {
                TransportEvent::JobProcess(ref process) => {
                    let record = event.to_record()?;
                    let offset = self.broker.append(process, record);
                    Ok(Some(offset.to_string()))
                }
                TransportEvent::JobCancel(cancel) => {
                    self.broker.cancel(&cancel);
                    Ok(None)
                }
                TransportEvent::JobStatus(status) | TransportEvent::JobResult(status) => {
                    self.broker.apply_status(&status);
                    Ok(None)
                }
                TransportEvent::WorkerRegister(worker) => {
                    let registration =
                        WorkerRegistration::new_local(worker.worker_id, "", worker.queues);
                    self.broker
                        .register(registration, self.broker.config.registration_ttl);
                    Ok(None)
                }
                TransportEvent::WorkerUnregister(worker) => {
                    self.broker.unregister(&worker.worker_id);
                    Ok(None)
                }
            }
        }
        .boxed()
    }

    fn on_message(&self, handler: MessageHandler) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handler);
    }

    fn consume(&self, options: ConsumerOptions) -> BoxFuture<'_, Result<()>> {
        async move {
            self.check()?;
            let handle = tokio::spawn(consume_loop(
                self.broker.clone(),
                self.handlers.clone(),
                options,
                self.broker.signals.subscribe(),
                self.shutdown_tx.subscribe(),
            ));
            self.consumers().push(handle);
            Ok(())
        }
        .boxed()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportNotification> {
        self.broker.notifications.subscribe()
    }

    fn get_job_status(&self, key: &JobKey) -> BoxFuture<'_, Result<Option<JobStatusInfo>>> {
        let key = key.clone();
        async move {
            self.check()?;
            Ok(self.broker.status(&key))
        }
        .boxed()
    }

    fn find_job_statuses(
        &self,
        queue: &str,
        job_id: &str,
    ) -> BoxFuture<'_, Result<Vec<JobStatusInfo>>> {
        let (queue, job_id) = (queue.to_string(), job_id.to_string());
        async move {
            self.check()?;
            let now = Instant::now();
            let mut found: Vec<JobStatusInfo> = self
                .broker
                .state()
                .statuses
                .values()
                .filter(|s| s.expires_at > now && s.info.queue == queue && s.info.job_id == job_id)
                .map(|s| s.info.clone())
                .collect();
            found.sort_by_key(|info| std::cmp::Reverse(info.updated_at.unwrap_or(info.created_at)));
            Ok(found)
        }
        .boxed()
    }

    fn update_job_status(&self, info: JobStatusInfo) -> BoxFuture<'_, Result<()>> {
        async move {
            self.check()?;
            let mut info = info;
            info.updated_at = Some(Utc::now());
            self.broker.store_status(info);
            Ok(())
        }
        .boxed()
    }

    fn list_jobs(
        &self,
        queue: &str,
        status: JobStatus,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<JobStatusInfo>>> {
        let queue = queue.to_string();
        async move {
            self.check()?;
            let now = Instant::now();
            let state = self.broker.state();
            let mut matching: Vec<&StoredStatus> = state
                .statuses
                .values()
                .filter(|s| s.expires_at > now && s.info.queue == queue && s.info.status == status)
                .collect();
            matching.sort_by_key(|s| (s.priority, s.info.created_at));
            Ok(matching
                .into_iter()
                .take(limit)
                .map(|s| s.info.clone())
                .collect())
        }
        .boxed()
    }

    fn register_worker(
        &self,
        registration: WorkerRegistration,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<()>> {
        async move {
            self.check()?;
            self.broker.register(registration, ttl);
            Ok(())
        }
        .boxed()
    }

    fn unregister_worker(&self, worker_id: &str) -> BoxFuture<'_, Result<()>> {
        let worker_id = worker_id.to_string();
        async move {
            self.check()?;
            self.broker.unregister(&worker_id);
            Ok(())
        }
        .boxed()
    }

    fn list_workers(&self) -> BoxFuture<'_, Result<Vec<WorkerRegistration>>> {
        async move {
            self.check()?;
            let now = Instant::now();
            let mut workers: Vec<WorkerRegistration> = self
                .broker
                .state()
                .workers
                .values()
                .filter(|(_, expires_at)| *expires_at > now)
                .map(|(reg, _)| reg.clone())
                .collect();
            workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
            Ok(workers)
        }
        .boxed()
    }

    fn acquire_job_lock(
        &self,
        queue: &str,
        job_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool>> {
        let (queue, job_id, holder) = (queue.to_string(), job_id.to_string(), holder.to_string());
        async move {
            self.check()?;
            Ok(self.broker.acquire(&queue, &job_id, &holder, ttl))
        }
        .boxed()
    }

    fn release_job_lock(
        &self,
        queue: &str,
        job_id: &str,
        holder: &str,
    ) -> BoxFuture<'_, Result<bool>> {
        let (queue, job_id, holder) = (queue.to_string(), job_id.to_string(), holder.to_string());
        async move {
            self.check()?;
            Ok(self.broker.release(&queue, &job_id, &holder))
        }
        .boxed()
    }

    fn is_job_locked(&self, queue: &str, job_id: &str) -> BoxFuture<'_, Result<bool>> {
        let (queue, job_id) = (queue.to_string(), job_id.to_string());
        async move {
            self.check()?;
            Ok(self.broker.is_locked(&queue, &job_id))
        }
        .boxed()
    }

    fn run_maintenance(
        &self,
        policy: MaintenancePolicy,
    ) -> BoxFuture<'_, Result<MaintenanceReport>> {
        async move {
            self.check()?;
            Ok(self.broker.maintain(policy))
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::job::JobOptions;
    use tokio::sync::mpsc;

    async fn connected(broker: &Arc<MemoryBroker>) -> MemoryTransport {
        let transport = MemoryTransport::new(broker.clone());
        transport.connect().await.unwrap();
        transport
    }

    fn process(queue: &str, job_id: &str) -> ProcessEvent {
        ProcessEvent {
            job: "noop".into(),
            args: serde_json::json!({}),
            job_id: job_id.into(),
            dispatch_id: Uuid::new_v4(),
            queue: queue.into(),
            options: JobOptions::default(),
        }
    }

    fn recording_handler(tx: mpsc::UnboundedSender<TransportEvent>) -> MessageHandler {
        Arc::new(move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let broker = MemoryBroker::new();
        let transport = MemoryTransport::new(broker);
        let err = transport
            .send(TransportEvent::JobProcess(process("q", "a")))
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::Transport(_)));
    }

    #[tokio::test]
    async fn test_send_writes_pending_status() {
        let broker = MemoryBroker::new();
        let transport = connected(&broker).await;
        let event = process("emails", "mail-1");
        let key = JobKey::new("emails", "mail-1", event.dispatch_id);

        let offset = transport
            .send(TransportEvent::JobProcess(event))
            .await
            .unwrap();
        assert_eq!(offset.as_deref(), Some("1"));
        assert_eq!(broker.stream_len("emails"), 1);

        let info = transport.get_job_status(&key).await.unwrap().unwrap();
        assert_eq!(info.status, JobStatus::Pending);
        assert_eq!(info.message_id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_status_round_trip() {
        let broker = MemoryBroker::new();
        let transport = connected(&broker).await;
        let key = JobKey::new("q", "a", Uuid::new_v4());

        let mut info = JobStatusInfo::pending(&key);
        info.status = JobStatus::Failed;
        info.retries = 2;
        info.error = Some("boom".into());
        transport.update_job_status(info).await.unwrap();

        let stored = transport.get_job_status(&key).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retries, 2);
        assert_eq!(stored.error.as_deref(), Some("boom"));
        assert!(stored.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_status_event_publishes_notification() {
        let broker = MemoryBroker::new();
        let transport = connected(&broker).await;
        let mut rx = transport.subscribe();
        let key = JobKey::new("q", "a", Uuid::new_v4());

        transport
            .send(TransportEvent::status(StatusEvent {
                job_id: "a".into(),
                dispatch_id: key.dispatch_id,
                queue: "q".into(),
                status: JobStatus::Completed,
                error: None,
                retries: Some(0),
                completed_at: None,
            }))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            TransportNotification::StatusChanged(info) => {
                assert_eq!(info.key(), key);
                assert_eq!(info.status, JobStatus::Completed);
                assert!(info.completed_at.is_some());
            }
            other => panic!("unexpected notification {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_release() {
        let broker = MemoryBroker::new();
        let a = connected(&broker).await;
        let b = connected(&broker).await;
        let mut rx = b.subscribe();
        let ttl = Duration::from_secs(30);

        assert!(a.acquire_job_lock("q", "job", "worker-a", ttl).await.unwrap());
        assert!(!b.acquire_job_lock("q", "job", "worker-b", ttl).await.unwrap());
        assert!(b.is_job_locked("q", "job").await.unwrap());

        assert!(!b.release_job_lock("q", "job", "worker-b").await.unwrap());
        assert!(a.release_job_lock("q", "job", "worker-a").await.unwrap());
        assert_eq!(
            rx.recv().await.unwrap(),
            TransportNotification::LockReleased {
                queue: "q".into(),
                job_id: "job".into()
            }
        );
        assert!(b.acquire_job_lock("q", "job", "worker-b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let broker = MemoryBroker::new();
        let t = connected(&broker).await;
        assert!(t
            .acquire_job_lock("q", "job", "a", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!t.is_job_locked("q", "job").await.unwrap());
        assert!(t
            .acquire_job_lock("q", "job", "b", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_consumer_receives_and_acks() {
        let broker = MemoryBroker::new();
        let producer = connected(&broker).await;
        let consumer = connected(&broker).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        consumer.on_message(recording_handler(tx));
        consumer
            .consume(ConsumerOptions::new("worker-1", vec!["q".into()]))
            .await
            .unwrap();

        producer
            .send(TransportEvent::JobProcess(process("q", "a")))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type(), "job:process");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.pending_count("q"), 0);
        consumer.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_handler_leaves_record_for_redelivery() {
        let broker = MemoryBroker::with_config(MemoryBrokerConfig {
            visibility_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        let producer = connected(&broker).await;
        let consumer = connected(&broker).await;

        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = attempts.clone();
        consumer.on_message(Arc::new(move |_event| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ConveyorError::Transport("crashed".into()))
                } else {
                    Ok(())
                }
            }
            .boxed()
        }));
        let mut options = ConsumerOptions::new("worker-1", vec!["q".into()]);
        options.poll_interval = Duration::from_millis(10);
        consumer.consume(options).await.unwrap();

        producer
            .send(TransportEvent::JobProcess(process("q", "a")))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(attempts.load(Ordering::SeqCst) >= 2);
        assert_eq!(broker.pending_count("q"), 0);
        consumer.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_removes_undelivered_record() {
        let broker = MemoryBroker::new();
        let producer = connected(&broker).await;
        let event = process("q", "a");
        let key = JobKey::new("q", "a", event.dispatch_id);
        producer
            .send(TransportEvent::JobProcess(event))
            .await
            .unwrap();

        producer
            .send(TransportEvent::JobCancel(CancelEvent {
                job_id: Some("a".into()),
                dispatch_id: None,
                queue: "q".into(),
            }))
            .await
            .unwrap();

        assert_eq!(broker.pending_count("q"), 0);
        let info = producer.get_job_status(&key).await.unwrap().unwrap();
        assert_eq!(info.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_list_jobs_orders_by_priority() {
        let broker = MemoryBroker::new();
        let t = connected(&broker).await;
        for (id, priority) in [("low", 9), ("high", 1), ("mid", 5)] {
            let mut event = process("q", id);
            event.options.priority = Some(priority);
            t.send(TransportEvent::JobProcess(event)).await.unwrap();
        }

        let pending = t.list_jobs("q", JobStatus::Pending, 10).await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|i| i.job_id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);

        let top = t.list_jobs("q", JobStatus::Pending, 1).await.unwrap();
        assert_eq!(top.len(), 1);
    }

    #[tokio::test]
    async fn test_worker_registration_expires() {
        let broker = MemoryBroker::new();
        let t = connected(&broker).await;
        t.register_worker(
            WorkerRegistration::new_local("w1", "host", vec!["q".into()]),
            Duration::from_millis(20),
        )
        .await
        .unwrap();
        assert_eq!(t.list_workers().await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(t.list_workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_maintenance_trims_and_purges() {
        let broker = MemoryBroker::new();
        let producer = connected(&broker).await;
        let consumer = connected(&broker).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        consumer.on_message(recording_handler(tx));
        consumer
            .consume(ConsumerOptions::new("w", vec!["q".into()]))
            .await
            .unwrap();

        for i in 0..5 {
            producer
                .send(TransportEvent::JobProcess(process("q", &format!("job-{}", i))))
                .await
                .unwrap();
        }
        for _ in 0..5 {
            tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let finished = JobKey::new("q", "done", Uuid::new_v4());
        let mut info = JobStatusInfo::pending(&finished);
        info.status = JobStatus::Completed;
        info.created_at = Utc::now() - chrono::Duration::hours(2);
        info.updated_at = info.created_at.into();
        producer.broker.store_status(info);

        let report = producer
            .run_maintenance(MaintenancePolicy {
                stream_max_len: 2,
                retention: Duration::from_secs(60),
            })
            .await
            .unwrap();

        assert_eq!(report.trimmed_records, 3);
        assert_eq!(report.purged_statuses, 1);
        assert_eq!(broker.stream_len("q"), 2);
        assert!(producer.get_job_status(&finished).await.unwrap().is_none());
        consumer.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_outage_fails_calls() {
        let broker = MemoryBroker::new();
        let t = connected(&broker).await;
        broker.set_available(false);
        assert!(t.list_workers().await.is_err());
        broker.set_available(true);
        assert!(t.list_workers().await.is_ok());
    }
}
