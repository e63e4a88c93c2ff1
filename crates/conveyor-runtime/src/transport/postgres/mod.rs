//! Postgres-backed broker.
//!
//! Streams are rows in `conveyor_stream` claimed with `FOR UPDATE SKIP LOCKED`.
//! Signals travel over LISTEN/NOTIFY on one channel; consumers still poll so
//! a missed notification only costs latency.

mod listener;
mod pool;
mod signal;
mod sql;

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::Utc;
use conveyor_core::cluster::WorkerRegistration;
use conveyor_core::config::ConveyorConfig;
use conveyor_core::job::JobStatus;
use conveyor_core::transport::{
    CancelEvent, ConsumerOptions, JobKey, JobStatusInfo, MaintenancePolicy, MaintenanceReport,
    MessageHandler, ProcessEvent, StatusEvent, Transport, TransportEvent, TransportNotification,
    WorkerEvent,
};
use conveyor_core::{ConveyorError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::postgres::PgExecutor;
use sqlx::PgPool;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::deliver;
use crate::migrations::MigrationRunner;

pub use listener::SignalListener;
pub use pool::BrokerPool;
pub use signal::{channel_name, Signal};

#[derive(Debug, Clone)]
pub struct PostgresTransportConfig {
    pub url: String,
    pub pool_size: u32,
    pub pool_timeout: Duration,
    /// Prefix of the NOTIFY channel.
    pub channel_prefix: String,
    /// How long a claimed record may go unacknowledged before redelivery.
    pub visibility_timeout: Duration,
    /// Lifetime of a status row after its last write.
    pub status_ttl: Duration,
    /// TTL applied to `worker:register` events.
    pub registration_ttl: Duration,
    /// Apply the built-in schema when connecting.
    pub migrate_on_connect: bool,
}

impl PostgresTransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: 10,
            pool_timeout: Duration::from_secs(30),
            channel_prefix: "conveyor".to_string(),
            visibility_timeout: Duration::from_secs(300),
            status_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            registration_ttl: Duration::from_secs(30),
            migrate_on_connect: true,
        }
    }

    pub fn from_config(config: &ConveyorConfig) -> Self {
        Self {
            url: config.broker.url.clone(),
            pool_size: config.broker.pool_size,
            pool_timeout: config.broker.pool_timeout(),
            channel_prefix: config.broker.channel_prefix.clone(),
            visibility_timeout: config.broker.visibility_timeout(),
            status_ttl: config.maintenance.status_ttl(),
            registration_ttl: config.worker.registration_ttl(),
            migrate_on_connect: true,
        }
    }

    pub fn with_migrate_on_connect(mut self, migrate: bool) -> Self {
        self.migrate_on_connect = migrate;
        self
    }
}

pub struct PostgresTransport {
    config: PostgresTransportConfig,
    channel: String,
    pool: RwLock<Option<BrokerPool>>,
    handlers: Arc<RwLock<Vec<MessageHandler>>>,
    signals: broadcast::Sender<Signal>,
    notifications: broadcast::Sender<TransportNotification>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PostgresTransport {
    pub fn new(config: PostgresTransportConfig) -> Self {
        let (signals, _) = broadcast::channel(1024);
        let (notifications, _) = broadcast::channel(1024);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            channel: channel_name(&config.channel_prefix),
            config,
            pool: RwLock::new(None),
            handlers: Arc::new(RwLock::new(Vec::new())),
            signals,
            notifications,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PostgresTransportConfig {
        &self.config
    }

    /// NOTIFY channel carrying broker signals.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn pool(&self) -> Result<PgPool> {
        self.pool
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|p| p.pool().clone())
            .ok_or_else(|| ConveyorError::Transport("transport not connected".to_string()))
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn append(&self, event: &TransportEvent, process: &ProcessEvent) -> Result<String> {
        let pool = self.pool()?;
        let record = sql::record_value(&event.to_record()?)?;
        let key = JobKey::new(process.queue.clone(), process.job_id.clone(), process.dispatch_id);

        let mut tx = pool.begin().await?;
        let (offset,): (i64,) = sqlx::query_as(sql::APPEND)
            .bind(&process.queue)
            .bind(event.event_type())
            .bind(record)
            .bind(process.options.priority())
            .fetch_one(&mut *tx)
            .await?;

        let mut info = JobStatusInfo::pending(&key);
        info.message_id = Some(offset.to_string());
        upsert_status(&mut *tx, &info, process.options.priority(), self.config.status_ttl).await?;

        let signal = Signal::NewMessage {
            queue: process.queue.clone(),
            offset,
        };
        notify(&mut *tx, &self.channel, &signal).await?;
        notify(&mut *tx, &self.channel, &Signal::status(&info)).await?;
        tx.commit().await?;

        tracing::debug!(
            queue = %process.queue,
            job_id = %process.job_id,
            dispatch_id = %process.dispatch_id,
            offset,
            "Appended job record"
        );
        Ok(offset.to_string())
    }

    /// Drop undelivered records targeted by a cancel and fan it out.
    async fn cancel(&self, event: &CancelEvent) -> Result<()> {
        let pool = self.pool()?;
        let rows: Vec<(Option<String>, Option<String>)> = sqlx::query_as(sql::CANCEL_UNCLAIMED)
            .bind(&event.queue)
            .bind(event.job_id.as_deref())
            .bind(event.dispatch_id.map(|d| d.to_string()))
            .fetch_all(&pool)
            .await?;

        for row in rows {
            let (Some(job_id), Some(dispatch_id)) = row else {
                continue;
            };
            let Ok(dispatch_id) = Uuid::parse_str(&dispatch_id) else {
                continue;
            };
            let key = JobKey::new(event.queue.clone(), job_id, dispatch_id);
            if let Some(mut info) = self.status(&pool, &key).await? {
                let cancelled = StatusEvent {
                    status: JobStatus::Cancelled,
                    ..info.to_event()
                };
                info.apply(&cancelled);
                self.store_status(&pool, &info).await?;
            }
        }

        notify(&pool, &self.channel, &Signal::Cancel(event.clone())).await
    }

    async fn status(&self, pool: &PgPool, key: &JobKey) -> Result<Option<JobStatusInfo>> {
        let row = sqlx::query(sql::GET_STATUS)
            .bind(&key.queue)
            .bind(&key.job_id)
            .bind(key.dispatch_id)
            .fetch_optional(pool)
            .await?;
        row.as_ref().map(sql::status_from_row).transpose()
    }

    async fn store_status(&self, pool: &PgPool, info: &JobStatusInfo) -> Result<()> {
        upsert_status(pool, info, 0, self.config.status_ttl).await?;
        notify(pool, &self.channel, &Signal::status(info)).await
    }

    async fn apply_status(&self, event: &StatusEvent) -> Result<()> {
        let pool = self.pool()?;
        let key = JobKey::new(event.queue.clone(), event.job_id.clone(), event.dispatch_id);
        let mut info = self
            .status(&pool, &key)
            .await?
            .unwrap_or_else(|| JobStatusInfo::pending(&key));
        info.apply(event);
        self.store_status(&pool, &info).await
    }

    async fn register(&self, registration: WorkerRegistration, ttl: Duration) -> Result<()> {
        let pool = self.pool()?;
        sqlx::query(sql::REGISTER_WORKER)
            .bind(&registration.worker_id)
            .bind(serde_json::to_value(&registration)?)
            .bind(sql::secs(ttl))
            .execute(&pool)
            .await?;

        let signal = Signal::WorkerRegister(WorkerEvent {
            worker_id: registration.worker_id,
            queues: registration.queues,
        });
        notify(&pool, &self.channel, &signal).await
    }

    async fn unregister(&self, worker_id: &str) -> Result<()> {
        let pool = self.pool()?;
        let removed: Option<(String,)> = sqlx::query_as(sql::UNREGISTER_WORKER)
            .bind(worker_id)
            .fetch_optional(&pool)
            .await?;

        if let Some((text,)) = removed {
            let registration: WorkerRegistration = serde_json::from_str(&text)?;
            let signal = Signal::WorkerUnregister(WorkerEvent {
                worker_id: registration.worker_id,
                queues: registration.queues,
            });
            notify(&pool, &self.channel, &signal).await?;
        }
        Ok(())
    }
}

async fn upsert_status<'e, E: PgExecutor<'e>>(
    executor: E,
    info: &JobStatusInfo,
    priority: i32,
    ttl: Duration,
) -> Result<()> {
    sqlx::query(sql::UPSERT_STATUS)
        .bind(&info.queue)
        .bind(&info.job_id)
        .bind(info.dispatch_id)
        .bind(info.status.as_str())
        .bind(priority)
        .bind(info.error.as_deref())
        .bind(i32::try_from(info.retries).unwrap_or(i32::MAX))
        .bind(info.message_id.as_deref())
        .bind(info.created_at)
        .bind(info.started_at)
        .bind(info.completed_at)
        .bind(info.updated_at)
        .bind(sql::secs(ttl))
        .execute(executor)
        .await?;
    Ok(())
}

async fn notify<'e, E: PgExecutor<'e>>(executor: E, channel: &str, signal: &Signal) -> Result<()> {
    sqlx::query(sql::NOTIFY)
        .bind(channel)
        .bind(signal.encode()?)
        .execute(executor)
        .await?;
    Ok(())
}

async fn claim(
    pool: &PgPool,
    options: &ConsumerOptions,
    visibility: Duration,
) -> Result<Vec<(i64, String, String)>> {
    let mut batch: Vec<(i64, String, String)> = sqlx::query_as(sql::CLAIM)
        .bind(&options.queues)
        .bind(&options.consumer_id)
        .bind(sql::secs(visibility))
        .bind(i64::try_from(options.batch_size).unwrap_or(i64::MAX))
        .fetch_all(pool)
        .await?;
    batch.sort_by_key(|(id, _, _)| *id);
    Ok(batch)
}

async fn ack(pool: &PgPool, id: i64) {
    if let Err(e) = sqlx::query(sql::ACK).bind(id).execute(pool).await {
        tracing::warn!(offset = id, "Failed to acknowledge record: {}", e);
    }
}

async fn consume_loop(
    pool: PgPool,
    handlers: Arc<RwLock<Vec<MessageHandler>>>,
    options: ConsumerOptions,
    visibility: Duration,
    mut signals: broadcast::Receiver<Signal>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        loop {
            let batch = match claim(&pool, &options, visibility).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(consumer = %options.consumer_id, "Failed to claim records: {}", e);
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }
            for (id, queue, text) in batch {
                match sql::parse_record(&text).and_then(|r| TransportEvent::from_record(&r)) {
                    Ok(event) => {
                        if deliver(&handlers, event).await {
                            ack(&pool, id).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(queue = %queue, offset = id, "Dropping malformed record: {}", e);
                        ack(&pool, id).await;
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

impl Transport for PostgresTransport {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            if self.is_connected() {
                return Ok(());
            }
            let broker = BrokerPool::connect(
                &self.config.url,
                self.config.pool_size,
                self.config.pool_timeout,
            )
            .await?;
            broker.health_check().await?;

            if self.config.migrate_on_connect {
                let applied = MigrationRunner::new(broker.pool().clone()).run().await?;
                if !applied.is_empty() {
                    tracing::info!(migrations = ?applied, "Applied broker migrations");
                }
            }

            self.shutdown_tx.send_replace(false);
            let listener = SignalListener::new(
                broker.pool().clone(),
                self.channel.clone(),
                self.signals.clone(),
                self.notifications.clone(),
                self.shutdown_tx.subscribe(),
            );
            self.tasks().push(tokio::spawn(async move {
                if let Err(e) = listener.run().await {
                    tracing::warn!("Signal listener stopped, consumers fall back to polling: {}", e);
                }
            }));

            *self.pool.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(broker);
            tracing::info!(channel = %self.channel, "Connected to postgres broker");
            Ok(())
        }
        .boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            let broker = self
                .pool
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            self.shutdown_tx.send_replace(true);
            let tasks: Vec<JoinHandle<()>> = self.tasks().drain(..).collect();
            for task in tasks {
                let _ = task.await;
            }
            if let Some(broker) = broker {
                broker.close().await;
            }
            Ok(())
        }
        .boxed()
    }

    fn is_connected(&self) -> bool {
        self.pool
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    fn send(&self, event: TransportEvent) -> BoxFuture<'_, Result<Option<String>>> {
        async move {
            match event {
                TransportEvent::JobProcess(ref process) => {
                    self.append(&event, process).await.map(Some)
                }
                TransportEvent::JobCancel(cancel) => self.cancel(&cancel).await.map(|_| None),
                TransportEvent::JobStatus(status) | TransportEvent::JobResult(status) => {
                    self.apply_status(&status).await.map(|_| None)
                }
                TransportEvent::WorkerRegister(worker) => {
                    let registration =
                        WorkerRegistration::new_local(worker.worker_id, "", worker.queues);
                    self.register(registration, self.config.registration_ttl)
                        .await
                        .map(|_| None)
                }
                TransportEvent::WorkerUnregister(worker) => {
                    self.unregister(&worker.worker_id).await.map(|_| None)
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
            let pool = self.pool()?;
            let handle = tokio::spawn(consume_loop(
                pool,
                self.handlers.clone(),
                options,
                self.config.visibility_timeout,
                self.signals.subscribe(),
                self.shutdown_tx.subscribe(),
            ));
            self.tasks().push(handle);
            Ok(())
        }
        .boxed()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportNotification> {
        self.notifications.subscribe()
    }

    fn get_job_status(&self, key: &JobKey) -> BoxFuture<'_, Result<Option<JobStatusInfo>>> {
        let key = key.clone();
        async move {
            let pool = self.pool()?;
            self.status(&pool, &key).await
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
            let pool = self.pool()?;
            let rows = sqlx::query(sql::FIND_STATUSES)
                .bind(&queue)
                .bind(&job_id)
                .fetch_all(&pool)
                .await?;
            rows.iter().map(sql::status_from_row).collect()
        }
        .boxed()
    }

    fn update_job_status(&self, info: JobStatusInfo) -> BoxFuture<'_, Result<()>> {
        async move {
            let pool = self.pool()?;
            let mut info = info;
            info.updated_at = Some(Utc::now());
            self.store_status(&pool, &info).await
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
            let pool = self.pool()?;
            let rows = sqlx::query(sql::LIST_JOBS)
                .bind(&queue)
                .bind(status.as_str())
                .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                .fetch_all(&pool)
                .await?;
            rows.iter().map(sql::status_from_row).collect()
        }
        .boxed()
    }

    fn register_worker(
        &self,
        registration: WorkerRegistration,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<()>> {
        async move { self.register(registration, ttl).await }.boxed()
    }

    fn unregister_worker(&self, worker_id: &str) -> BoxFuture<'_, Result<()>> {
        let worker_id = worker_id.to_string();
        async move { self.unregister(&worker_id).await }.boxed()
    }

    fn list_workers(&self) -> BoxFuture<'_, Result<Vec<WorkerRegistration>>> {
        async move {
            let pool = self.pool()?;
            let rows: Vec<(String,)> = sqlx::query_as(sql::LIST_WORKERS).fetch_all(&pool).await?;
            let mut workers = Vec::with_capacity(rows.len());
            for (text,) in rows {
                match serde_json::from_str::<WorkerRegistration>(&text) {
                    Ok(registration) => workers.push(registration),
                    Err(e) => tracing::warn!("Skipping unreadable worker registration: {}", e),
                }
            }
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
            let pool = self.pool()?;
            let taken: Option<(String,)> = sqlx::query_as(sql::ACQUIRE_LOCK)
                .bind(&queue)
                .bind(&job_id)
                .bind(&holder)
                .bind(sql::secs(ttl))
                .fetch_optional(&pool)
                .await?;
            Ok(taken.is_some())
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
            let pool = self.pool()?;
            let released = sqlx::query(sql::RELEASE_LOCK)
                .bind(&queue)
                .bind(&job_id)
                .bind(&holder)
                .execute(&pool)
                .await?
                .rows_affected()
                > 0;
            if released {
                notify(&pool, &self.channel, &Signal::LockReleased { queue, job_id }).await?;
            }
            Ok(released)
        }
        .boxed()
    }

    fn is_job_locked(&self, queue: &str, job_id: &str) -> BoxFuture<'_, Result<bool>> {
        let (queue, job_id) = (queue.to_string(), job_id.to_string());
        async move {
            let pool = self.pool()?;
            let (locked,): (bool,) = sqlx::query_as(sql::IS_LOCKED)
                .bind(&queue)
                .bind(&job_id)
                .fetch_one(&pool)
                .await?;
            Ok(locked)
        }
        .boxed()
    }

    fn run_maintenance(
        &self,
        policy: MaintenancePolicy,
    ) -> BoxFuture<'_, Result<MaintenanceReport>> {
        async move {
            let pool = self.pool()?;
            let trimmed_records = sqlx::query(sql::TRIM_STREAMS)
                .bind(i64::try_from(policy.stream_max_len).unwrap_or(i64::MAX))
                .execute(&pool)
                .await?
                .rows_affected();
            let purged_statuses = sqlx::query(sql::PURGE_STATUSES)
                .bind(sql::secs(policy.retention))
                .execute(&pool)
                .await?
                .rows_affected();
            let expired_locks = sqlx::query(sql::EXPIRE_LOCKS)
                .execute(&pool)
                .await?
                .rows_affected();
            let expired_workers = sqlx::query(sql::EXPIRE_WORKERS)
                .execute(&pool)
                .await?
                .rows_affected();

            Ok(MaintenanceReport {
                trimmed_records,
                purged_statuses,
                expired_locks,
                expired_workers,
            })
        }
        .boxed()
    }
}
