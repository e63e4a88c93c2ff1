use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use conveyor_core::cluster::{WorkerRegistration, WorkerStatus};
use conveyor_core::config::{ConveyorConfig, QueueConfig};
use conveyor_core::job::{Job, JobOptions, JobStatus, OverlapBehavior, DEFAULT_QUEUE};
use conveyor_core::transport::{
    CancelEvent, ConsumerOptions, MessageHandler, StatusEvent, Transport, TransportEvent,
    TransportNotification,
};
use conveyor_core::{ConveyorError, Result};
use futures::FutureExt;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::queue_state::{QueueState, QueueStats, QueuedJob};
use super::registry::JobRegistry;
use crate::cluster::{HeartbeatConfig, HeartbeatLoop, MaintenanceLoop, MaintenanceLoopConfig};

/// Observable worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Nothing running.
    Idle,
    /// At least one job running.
    Active,
    /// Every queue paused and nothing running.
    Paused,
    /// Some queue is finishing in-flight jobs and refusing new ones.
    Draining,
    Stopping,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Draining => "draining",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Draining,
    Stopping,
    Stopped,
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_id: String,
    pub hostname: String,
    pub queues: Vec<QueueConfig>,
    /// Upper bound on scheduler sleeps and the contention backoff.
    pub poll_interval: Duration,
    /// TTL of NO_OVERLAP locks.
    pub lock_ttl: Duration,
    /// How long a graceful stop waits for active jobs.
    pub drain_timeout: Duration,
    /// Membership heartbeat. Disabled when `None`.
    pub heartbeat: Option<HeartbeatConfig>,
    /// Broker maintenance. Disabled when `None`.
    pub maintenance: Option<MaintenanceLoopConfig>,
}

impl WorkerOptions {
    pub fn new(worker_id: impl Into<String>, queues: Vec<QueueConfig>) -> Self {
        Self {
            worker_id: worker_id.into(),
            hostname: String::new(),
            queues,
            poll_interval: Duration::from_millis(500),
            lock_ttl: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(30),
            heartbeat: Some(HeartbeatConfig::default()),
            maintenance: None,
        }
    }

    /// Build from the `[worker]`, `[[queues]]` and `[maintenance]` sections.
    ///
    /// Without explicit queues the worker consumes the default queue.
    pub fn from_config(config: &ConveyorConfig, worker_id: impl Into<String>) -> Self {
        let queues = if config.queues.is_empty() {
            vec![config.queue(DEFAULT_QUEUE)]
        } else {
            config.queues.clone()
        };

        Self {
            worker_id: worker_id.into(),
            hostname: String::new(),
            queues,
            poll_interval: config.worker.poll_interval(),
            lock_ttl: config.worker.lock_ttl(),
            drain_timeout: config.worker.drain_timeout(),
            heartbeat: Some(HeartbeatConfig {
                interval: config.worker.heartbeat_interval(),
                registration_ttl: config.worker.registration_ttl(),
            }),
            maintenance: Some(MaintenanceLoopConfig::from(&config.maintenance)),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }
}

/// Consumes queues from a transport and runs their jobs.
///
/// Cloning yields another handle to the same worker.
#[derive(Clone)]
pub struct Worker {
    core: Arc<WorkerCore>,
}

struct WorkerCore {
    id: String,
    options: WorkerOptions,
    transport: Arc<dyn Transport>,
    registry: Arc<JobRegistry>,
    queues: Mutex<BTreeMap<String, QueueState>>,
    phase: Mutex<Phase>,
    started: AtomicBool,
    /// Wakes the scheduler.
    wake: Notify,
    /// Signalled whenever jobs leave the worker.
    settled: Notify,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    heartbeat: Option<Arc<HeartbeatLoop>>,
    maintenance: Option<Arc<MaintenanceLoop>>,
}

impl Worker {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<JobRegistry>,
        options: WorkerOptions,
    ) -> Self {
        let queues = options
            .queues
            .iter()
            .map(|q| (q.name.clone(), QueueState::new(q.clone())))
            .collect();

        let heartbeat = options.heartbeat.clone().map(|config| {
            let registration = WorkerRegistration::new_local(
                options.worker_id.clone(),
                options.hostname.clone(),
                options.queues.iter().map(|q| q.name.clone()).collect(),
            );
            Arc::new(HeartbeatLoop::new(transport.clone(), registration, config))
        });
        let maintenance = options.maintenance.clone().map(|config| {
            Arc::new(MaintenanceLoop::new(
                transport.clone(),
                options.worker_id.clone(),
                config,
            ))
        });

        let (shutdown_tx, _) = watch::channel(false);
        Self {
            core: Arc::new(WorkerCore {
                id: options.worker_id.clone(),
                options,
                transport,
                registry,
                queues: Mutex::new(queues),
                phase: Mutex::new(Phase::Created),
                started: AtomicBool::new(false),
                wake: Notify::new(),
                settled: Notify::new(),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
                heartbeat,
                maintenance,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// Add a queue. Queues added after [`Worker::start`] only receive jobs
    /// through [`Worker::add_job`].
    pub fn add_queue(&self, config: QueueConfig) -> bool {
        let mut queues = self.core.queues();
        if queues.contains_key(&config.name) {
            return false;
        }
        queues.insert(config.name.clone(), QueueState::new(config));
        true
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.core.queues().contains_key(name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.core.queues().keys().cloned().collect()
    }

    /// Admit a job into one of the worker's queues.
    pub fn add_job(&self, queue: &str, job: Job, options: &JobOptions) -> Result<()> {
        self.core.admit(queue, job, options)
    }

    /// Connect, start consuming and launch the background loops.
    ///
    /// A connection failure is returned to the caller.
    pub async fn start(&self) -> Result<()> {
        if self.core.started.swap(true, Ordering::SeqCst) {
            return Err(ConveyorError::InvalidState(format!(
                "worker {} was already started",
                self.core.id
            )));
        }

        let core = &self.core;
        core.transport.connect().await?;

        let weak = Arc::downgrade(core);
        let handler: MessageHandler = Arc::new(move |event| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(core) => core.handle_event(event).await,
                    None => Err(ConveyorError::InvalidState("worker dropped".to_string())),
                }
            }
            .boxed()
        });
        core.transport.on_message(handler);

        let mut consumer = ConsumerOptions::new(core.id.clone(), self.queue_names());
        consumer.poll_interval = core.options.poll_interval;
        core.transport.consume(consumer).await?;

        *core.phase() = Phase::Running;

        let mut tasks = vec![
            tokio::spawn(core.clone().schedule_loop()),
            tokio::spawn(notification_loop(
                Arc::downgrade(core),
                core.transport.subscribe(),
                core.shutdown_tx.subscribe(),
            )),
        ];
        if let Some(heartbeat) = core.heartbeat.clone() {
            if let Err(e) = heartbeat.beat().await {
                tracing::warn!(worker_id = %core.id, "Initial worker registration failed: {}", e);
            }
            tasks.push(tokio::spawn(async move { heartbeat.run().await }));
        }
        if let Some(maintenance) = core.maintenance.clone() {
            tasks.push(tokio::spawn(async move { maintenance.run().await }));
        }
        core.tasks().extend(tasks);

        tracing::info!(
            worker_id = %core.id,
            transport = core.transport.name(),
            queues = ?self.queue_names(),
            "Worker started"
        );
        Ok(())
    }

    /// Stop the worker.
    ///
    /// `force` cancels everything at once. Otherwise every queue is drained
    /// and active jobs get up to the drain timeout to finish.
    pub async fn stop(&self, force: bool) -> Result<()> {
        let core = &self.core;
        {
            let mut phase = core.phase();
            match *phase {
                Phase::Stopping | Phase::Stopped => return Ok(()),
                Phase::Created => {
                    *phase = Phase::Stopped;
                    return Ok(());
                }
                Phase::Running | Phase::Draining => {}
            }
        }

        if force {
            core.set_draining(None)?;
            let cancelled = core.cancel_all(None).await;
            tracing::info!(worker_id = %core.id, cancelled, "Worker force-stopping");
        } else {
            self.drain(None).await?;
            if !self.wait_idle(core.options.drain_timeout).await {
                tracing::warn!(
                    worker_id = %core.id,
                    active = core.active_total(),
                    "Drain timeout elapsed with jobs still running"
                );
            }
        }

        *core.phase() = Phase::Stopping;
        let _ = core.shutdown_tx.send(true);
        if let Some(heartbeat) = &core.heartbeat {
            heartbeat.stop();
        }
        if let Some(maintenance) = &core.maintenance {
            maintenance.stop();
        }

        let tasks: Vec<JoinHandle<()>> = core.tasks().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        if core.heartbeat.is_some() {
            if let Err(e) = core.transport.unregister_worker(&core.id).await {
                tracing::warn!(worker_id = %core.id, "Failed to unregister worker: {}", e);
            }
        }
        if let Err(e) = core.transport.disconnect().await {
            tracing::warn!(worker_id = %core.id, "Failed to disconnect transport: {}", e);
        }

        *core.phase() = Phase::Stopped;
        tracing::info!(worker_id = %core.id, "Worker stopped");
        Ok(())
    }

    /// Stop launching jobs from one queue, or all of them.
    pub fn pause(&self, queue: Option<&str>) -> Result<()> {
        self.core.for_queues(queue, |state| state.paused = true)?;
        tracing::info!(worker_id = %self.core.id, queue = ?queue, "Paused");
        Ok(())
    }

    /// Undo [`Worker::pause`] and [`Worker::drain`].
    pub fn resume(&self, queue: Option<&str>) -> Result<()> {
        self.core.for_queues(queue, |state| {
            state.paused = false;
            state.draining = false;
        })?;
        if queue.is_none() {
            let mut phase = self.core.phase();
            if *phase == Phase::Draining {
                *phase = Phase::Running;
            }
        }
        if let Some(heartbeat) = &self.core.heartbeat {
            heartbeat.set_status(WorkerStatus::Active);
        }
        tracing::info!(worker_id = %self.core.id, queue = ?queue, "Resumed");
        self.core.wake.notify_one();
        Ok(())
    }

    /// Refuse new jobs and cancel waiting and retrying ones. Active jobs
    /// keep running. Returns how many jobs were cancelled.
    pub async fn drain(&self, queue: Option<&str>) -> Result<usize> {
        let core = &self.core;
        core.set_draining(queue)?;

        let cancelled = core.cancel_pending(queue, true)?;
        let count = cancelled.len();
        core.report_cancelled(&cancelled).await;

        tracing::info!(worker_id = %core.id, queue = ?queue, cancelled = count, "Draining");
        Ok(count)
    }

    /// Cancel every waiting job. Returns how many were cancelled.
    pub async fn clear(&self, queue: Option<&str>) -> Result<usize> {
        let cancelled = self.core.cancel_pending(queue, false)?;
        self.core.report_cancelled(&cancelled).await;
        Ok(cancelled.len())
    }

    /// Cancel the dispatches of a job id, or one dispatch when given.
    pub async fn cancel_job(&self, queue: &str, job_id: &str, dispatch_id: Option<Uuid>) -> usize {
        self.core
            .cancel_matching(&CancelEvent {
                job_id: Some(job_id.to_string()),
                dispatch_id,
                queue: queue.to_string(),
            })
            .await
    }

    /// Cancel everything in one queue, or in all of them.
    pub async fn cancel_all_jobs(&self, queue: Option<&str>) -> usize {
        self.core.cancel_all(queue).await
    }

    /// Change a queue's concurrency, clamped to at least one.
    pub fn set_concurrency(&self, queue: &str, concurrency: usize) -> Result<usize> {
        let applied = {
            let mut queues = self.core.queues();
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| ConveyorError::NotFound(format!("queue '{}'", queue)))?;
            state.set_concurrency(concurrency)
        };
        self.core.wake.notify_one();
        Ok(applied)
    }

    pub fn queue_stats(&self, queue: &str) -> Option<QueueStats> {
        self.core.queues().get(queue).map(QueueState::stats)
    }

    pub fn state(&self) -> WorkerState {
        match *self.core.phase() {
            Phase::Stopped => return WorkerState::Stopped,
            Phase::Stopping => return WorkerState::Stopping,
            Phase::Draining => return WorkerState::Draining,
            Phase::Created | Phase::Running => {}
        }

        let queues = self.core.queues();
        let active = queues.values().any(|q| q.active_count() > 0);
        if queues.values().any(|q| q.draining) {
            WorkerState::Draining
        } else if active {
            WorkerState::Active
        } else if !queues.is_empty() && queues.values().all(|q| q.paused) {
            WorkerState::Paused
        } else {
            WorkerState::Idle
        }
    }

    /// Wait until no job is waiting, running or parked for retry.
    ///
    /// Returns `false` if the timeout elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let settled = self.core.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            if self.core.is_idle() {
                return true;
            }
            if tokio::time::timeout_at(deadline, settled).await.is_err() {
                return self.core.is_idle();
            }
        }
    }
}

enum Outcome {
    Finished(JobStatus),
    Retrying(u32),
    Exhausted { paused: bool },
}

impl WorkerCore {
    fn queues(&self) -> MutexGuard<'_, BTreeMap<String, QueueState>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_idle(&self) -> bool {
        self.queues().values().all(QueueState::is_empty)
    }

    fn active_total(&self) -> usize {
        self.queues().values().map(QueueState::active_count).sum()
    }

    /// Apply `f` to one named queue or to every queue.
    fn for_queues<F>(&self, queue: Option<&str>, mut f: F) -> Result<()>
    where
        F: FnMut(&mut QueueState),
    {
        let mut queues = self.queues();
        match queue {
            Some(name) => {
                let state = queues
                    .get_mut(name)
                    .ok_or_else(|| ConveyorError::NotFound(format!("queue '{}'", name)))?;
                f(state);
            }
            None => queues.values_mut().for_each(f),
        }
        Ok(())
    }

    fn admit(&self, queue: &str, job: Job, options: &JobOptions) -> Result<()> {
        let options = match self.registry.metadata(job.name()) {
            Some(meta) => options.or_metadata(meta),
            None => options.clone(),
        };
        {
            let mut queues = self.queues();
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| ConveyorError::NotFound(format!("queue '{}'", queue)))?;
            if state.draining {
                return Err(ConveyorError::Draining(queue.to_string()));
            }
            if state.contains(job.dispatch_id()) {
                tracing::debug!(
                    job_id = %job.id(),
                    dispatch_id = %job.dispatch_id(),
                    "Ignoring duplicate delivery"
                );
                return Ok(());
            }

            job.set_queue_name(queue);
            tracing::debug!(
                worker_id = %self.id,
                job_id = %job.id(),
                dispatch_id = %job.dispatch_id(),
                queue = %queue,
                priority = options.priority(),
                "Job admitted"
            );
            state.enqueue(QueuedJob::new(job, queue, &options));
        }
        self.wake.notify_one();
        Ok(())
    }

    async fn handle_event(&self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::JobProcess(process) => match self.registry.instantiate(&process) {
                Ok(job) => self.admit(&process.queue, job, &process.options),
                Err(e @ ConveyorError::NotFound(_)) => {
                    tracing::error!(
                        job = %process.job,
                        job_id = %process.job_id,
                        dispatch_id = %process.dispatch_id,
                        queue = %process.queue,
                        "Cannot run job: {}",
                        e
                    );
                    self.report(StatusEvent {
                        job_id: process.job_id,
                        dispatch_id: process.dispatch_id,
                        queue: process.queue,
                        status: JobStatus::Failed,
                        error: Some(e.to_string()),
                        retries: Some(0),
                        completed_at: None,
                    })
                    .await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            TransportEvent::JobCancel(cancel) => {
                self.cancel_matching(&cancel).await;
                Ok(())
            }
            other => {
                tracing::trace!(event = other.event_type(), "Ignoring event");
                Ok(())
            }
        }
    }

    async fn report(&self, event: StatusEvent) {
        let (job_id, status) = (event.job_id.clone(), event.status);
        if let Err(e) = self.transport.send(TransportEvent::status(event)).await {
            tracing::warn!(
                worker_id = %self.id,
                job_id = %job_id,
                status = %status,
                "Failed to report job status: {}",
                e
            );
        }
    }

    async fn report_cancelled(&self, cancelled: &[QueuedJob]) {
        for queued in cancelled {
            self.report(status_event(queued, JobStatus::Cancelled)).await;
        }
        if !cancelled.is_empty() {
            self.settled.notify_waiters();
        }
    }

    async fn cancel_matching(&self, event: &CancelEvent) -> usize {
        let cancelled = {
            let mut queues = self.queues();
            let Some(state) = queues.get_mut(&event.queue) else {
                return 0;
            };
            let matches =
                |q: &QueuedJob| event.matches(&q.queue_name, q.job.id(), q.dispatch_id());
            let mut cancelled = state.cancel_waiting(matches);
            cancelled.extend(state.cancel_retrying(matches));
            cancelled.extend(state.cancel_active(matches));
            cancelled
        };

        for queued in &cancelled {
            tracing::info!(
                job_id = %queued.job.id(),
                dispatch_id = %queued.dispatch_id(),
                queue = %queued.queue_name,
                "Job cancelled"
            );
        }
        self.report_cancelled(&cancelled).await;
        cancelled.len()
    }

    async fn cancel_all(&self, queue: Option<&str>) -> usize {
        let names: Vec<String> = match queue {
            Some(name) => vec![name.to_string()],
            None => self.queues().keys().cloned().collect(),
        };

        let mut total = 0;
        for name in names {
            total += self
                .cancel_matching(&CancelEvent {
                    job_id: None,
                    dispatch_id: None,
                    queue: name,
                })
                .await;
        }
        total
    }

    fn set_draining(&self, queue: Option<&str>) -> Result<()> {
        self.for_queues(queue, |state| state.draining = true)?;
        if queue.is_none() {
            let mut phase = self.phase();
            if *phase == Phase::Running {
                *phase = Phase::Draining;
            }
            if let Some(heartbeat) = &self.heartbeat {
                heartbeat.set_status(WorkerStatus::Draining);
            }
        }
        Ok(())
    }

    /// Cancel waiting jobs, and parked retries too when `retrying` is set.
    fn cancel_pending(&self, queue: Option<&str>, retrying: bool) -> Result<Vec<QueuedJob>> {
        let mut cancelled = Vec::new();
        self.for_queues(queue, |state| {
            cancelled.extend(state.cancel_waiting(|_| true));
            if retrying {
                cancelled.extend(state.cancel_retrying(|_| true));
            }
        })?;
        Ok(cancelled)
    }

    /// Effective `(max_retries, retry_delay)`: dispatch, then job type, then queue.
    fn retry_policy(&self, queued: &QueuedJob, config: &QueueConfig) -> (u32, Duration) {
        let meta = self.registry.metadata(queued.job.name());
        let max_retries = queued
            .max_retries
            .or_else(|| meta.and_then(|m| m.max_retries))
            .unwrap_or(config.max_retries);
        let retry_delay = queued
            .retry_delay
            .or_else(|| meta.and_then(|m| m.retry_delay))
            .unwrap_or_else(|| config.retry_delay());
        (max_retries, retry_delay)
    }

    async fn schedule_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let poll = self.options.poll_interval;

        loop {
            let next = self.schedule_pass();
            let sleep_for = next
                .map(|at| at.saturating_duration_since(Instant::now()))
                .map_or(poll, |d| d.min(poll));

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::debug!(worker_id = %self.id, "Scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Launch every due job that fits. Returns the next instant a waiting
    /// job becomes due.
    fn schedule_pass(self: &Arc<Self>) -> Option<Instant> {
        let now = Utc::now();
        let tick = Instant::now();
        let mut launches = Vec::new();
        let mut next: Option<Instant> = None;

        {
            let mut queues = self.queues();
            for state in queues.values_mut().filter(|s| !s.paused) {
                let slots = state.available_slots();
                if slots > 0 {
                    launches.extend(state.take_due(slots, now, tick));
                }
                if let Some(at) = state.next_wakeup(now, tick) {
                    next = Some(next.map_or(at, |n| n.min(at)));
                }
            }
        }

        let mut groups: Vec<Vec<QueuedJob>> = Vec::new();
        for queued in launches {
            match queued.overlap {
                OverlapBehavior::AllowOverlap => {
                    tokio::spawn(self.clone().run_single(queued));
                }
                OverlapBehavior::NoOverlap => {
                    let group = groups.iter_mut().find(|g| {
                        g[0].queue_name == queued.queue_name && g[0].job.id() == queued.job.id()
                    });
                    match group {
                        Some(group) => group.push(queued),
                        None => groups.push(vec![queued]),
                    }
                }
            }
        }
        for group in groups {
            tokio::spawn(self.clone().run_group(group));
        }

        next
    }

    async fn run_single(self: Arc<Self>, queued: QueuedJob) {
        self.execute(&queued).await;
        self.complete(queued).await;
    }

    /// Run NO_OVERLAP dispatches of one job id one after another, each under
    /// the broker lock.
    async fn run_group(self: Arc<Self>, group: Vec<QueuedJob>) {
        let mut pending = group.into_iter();
        while let Some(queued) = pending.next() {
            if queued.job.status() == JobStatus::Cancelled {
                self.complete(queued).await;
                continue;
            }

            let queue = queued.queue_name.clone();
            let job_id = queued.job.id().to_string();
            let holder = self.lock_holder(&queued);
            let acquired = self
                .transport
                .acquire_job_lock(&queue, &job_id, &holder, self.options.lock_ttl)
                .await;

            match acquired {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(
                        worker_id = %self.id,
                        "{}",
                        ConveyorError::LockContention { job_id, queue }
                    );
                    self.requeue_contended(std::iter::once(queued).chain(pending));
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        queue = %queue,
                        "Failed to acquire job lock: {}",
                        e
                    );
                    self.requeue_contended(std::iter::once(queued).chain(pending));
                    return;
                }
            }

            self.execute(&queued).await;
            self.release_lock(queue, job_id, holder, queued.overlap_delay).await;
            self.complete(queued).await;
        }
    }

    fn requeue_contended(&self, jobs: impl Iterator<Item = QueuedJob>) {
        let backoff_until = Instant::now() + self.options.poll_interval;
        {
            let mut queues = self.queues();
            for queued in jobs {
                if let Some(state) = queues.get_mut(&queued.queue_name) {
                    state.requeue_contended(queued, backoff_until);
                }
            }
        }
        self.wake.notify_one();
    }

    /// Locks belong to one dispatch, so a late release never frees a lock
    /// taken by a later dispatch of the same job id.
    fn lock_holder(&self, queued: &QueuedJob) -> String {
        format!("{}:{}", self.id, queued.dispatch_id())
    }

    async fn release_lock(
        &self,
        queue: String,
        job_id: String,
        holder: String,
        delay: Option<Duration>,
    ) {
        match delay {
            Some(delay) if !delay.is_zero() => {
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = transport.release_job_lock(&queue, &job_id, &holder).await {
                        tracing::warn!(job_id = %job_id, queue = %queue, "Failed to release job lock: {}", e);
                    }
                });
            }
            _ => {
                if let Err(e) = self
                    .transport
                    .release_job_lock(&queue, &job_id, &holder)
                    .await
                {
                    tracing::warn!(job_id = %job_id, queue = %queue, "Failed to release job lock: {}", e);
                }
            }
        }
    }

    async fn execute(self: &Arc<Self>, queued: &QueuedJob) -> JobStatus {
        let job = &queued.job;
        let max_retries = {
            let queues = self.queues();
            match queues.get(&queued.queue_name) {
                Some(state) => self.retry_policy(queued, &state.config).0,
                None => 0,
            }
        };

        let entry = match self.registry.get(job.name()) {
            Ok(entry) => entry,
            Err(e) => {
                job.fail(e.to_string());
                return job.status();
            }
        };

        tracing::debug!(
            worker_id = %self.id,
            job_id = %job.id(),
            dispatch_id = %job.dispatch_id(),
            queue = %queued.queue_name,
            attempt = job.retries() + 1,
            "Running job"
        );

        let args = job.args().clone();
        job.run(max_retries, |ctx| async move {
            self.report(status_event(queued, JobStatus::Running)).await;
            entry.execute(ctx, args).await
        })
        .await
    }

    /// Book-keep a job whose run ended and apply the retry policy.
    async fn complete(self: &Arc<Self>, queued: QueuedJob) {
        let job = queued.job.clone();
        let queue = queued.queue_name.clone();
        let dispatch_id = queued.dispatch_id();
        let status = job.status();

        let outcome = {
            let mut queues = self.queues();
            let Some(state) = queues.get_mut(&queue) else {
                return;
            };
            state.finish(dispatch_id);
            let (max_retries, retry_delay) = self.retry_policy(&queued, &state.config);

            if status != JobStatus::Failed {
                Outcome::Finished(status)
            } else if job.retries() < max_retries && !state.draining {
                match job.schedule_retry() {
                    Ok(retries) => {
                        let timer = self.spawn_readmit(queue.clone(), dispatch_id, retry_delay);
                        state.park_retry(queued.clone(), timer);
                        Outcome::Retrying(retries)
                    }
                    Err(_) => Outcome::Finished(job.status()),
                }
            } else {
                let paused = state.config.pause_on_error;
                if paused {
                    state.paused = true;
                }
                Outcome::Exhausted { paused }
            }
        };

        self.wake.notify_one();

        match outcome {
            Outcome::Finished(status) => {
                tracing::info!(
                    job_id = %job.id(),
                    dispatch_id = %dispatch_id,
                    queue = %queue,
                    status = %status,
                    "Job finished"
                );
                self.report(status_event(&queued, status)).await;
            }
            Outcome::Retrying(retries) => {
                tracing::warn!(
                    job_id = %job.id(),
                    dispatch_id = %dispatch_id,
                    queue = %queue,
                    retries,
                    error = ?job.last_error(),
                    "Job failed, will retry"
                );
                self.report(status_event(&queued, JobStatus::ScheduledForRetry))
                    .await;
            }
            Outcome::Exhausted { paused } => {
                tracing::error!(
                    job_id = %job.id(),
                    dispatch_id = %dispatch_id,
                    queue = %queue,
                    retries = job.retries(),
                    error = ?job.last_error(),
                    "Job failed permanently"
                );
                if paused {
                    tracing::warn!(queue = %queue, "Queue paused after job failure");
                }
                self.report(status_event(&queued, JobStatus::Failed)).await;
            }
        }
        self.settled.notify_waiters();
    }

    fn spawn_readmit(self: &Arc<Self>, queue: String, dispatch_id: Uuid, delay: Duration) -> JoinHandle<()> {
        let core = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(core) = core.upgrade() {
                core.readmit(&queue, dispatch_id).await;
            }
        })
    }

    /// Move a parked retry back to the waiting list, unless the queue is draining.
    async fn readmit(&self, queue: &str, dispatch_id: Uuid) {
        let cancelled = {
            let mut queues = self.queues();
            let Some(state) = queues.get_mut(queue) else {
                return;
            };
            let Some(mut queued) = state.take_retry(dispatch_id) else {
                return;
            };

            if state.draining {
                queued.job.cancel();
                Some(queued)
            } else {
                queued.job.requeue();
                queued.enqueued_at = Utc::now();
                queued.not_before = None;
                state.enqueue(queued);
                None
            }
        };

        match cancelled {
            Some(queued) => self.report_cancelled(&[queued]).await,
            None => self.wake.notify_one(),
        }
    }

    fn lock_released(&self, queue: &str, job_id: &str) {
        let released = self
            .queues()
            .get_mut(queue)
            .is_some_and(|state| state.lock_released(job_id));
        if released {
            self.wake.notify_one();
        }
    }
}

async fn notification_loop(
    worker: Weak<WorkerCore>,
    mut notifications: broadcast::Receiver<TransportNotification>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Ok(TransportNotification::LockReleased { queue, job_id }) => {
                    let Some(core) = worker.upgrade() else { break };
                    core.lock_released(&queue, &job_id);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let Some(core) = worker.upgrade() else { break };
                    core.wake.notify_one();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn status_event(queued: &QueuedJob, status: JobStatus) -> StatusEvent {
    let job = &queued.job;
    let error = match status {
        JobStatus::Failed | JobStatus::ScheduledForRetry => job.last_error(),
        _ => None,
    };
    StatusEvent {
        job_id: job.id().to_string(),
        dispatch_id: job.dispatch_id(),
        queue: queued.queue_name.clone(),
        status,
        error,
        retries: Some(job.retries()),
        completed_at: if status.is_terminal() {
            job.completed_at()
        } else {
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryBroker, MemoryTransport};
    use conveyor_core::job::{ConveyorJob, JobContext, JobMetadata};
    use conveyor_core::transport::{JobKey, ProcessEvent};
    use serde::{Deserialize, Serialize};
    use std::future::Future;
    use std::pin::Pin;

    static EVENTS: Mutex<Vec<(String, String)>> = Mutex::new(Vec::new());

    fn record(test: &str, event: String) {
        EVENTS
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((test.to_string(), event));
    }

    fn events(test: &str) -> Vec<String> {
        EVENTS
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|(t, _)| t == test)
            .map(|(_, e)| e.clone())
            .collect()
    }

    fn max_parallel(test: &str) -> usize {
        let mut running = 0usize;
        let mut max = 0;
        for event in events(test) {
            if event.starts_with("start:") {
                running += 1;
                max = max.max(running);
            } else {
                running -= 1;
            }
        }
        max
    }

    #[derive(Serialize, Deserialize)]
    struct RecorderArgs {
        test: String,
        label: String,
        #[serde(default)]
        sleep_ms: u64,
        #[serde(default)]
        fail: bool,
    }

    async fn record_run(args: RecorderArgs) -> Result<()> {
        record(&args.test, format!("start:{}", args.label));
        if args.sleep_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.sleep_ms)).await;
        }
        record(&args.test, format!("end:{}", args.label));
        if args.fail {
            return Err(ConveyorError::Execution("recorder failed".into()));
        }
        Ok(())
    }

    struct Recorder;

    impl ConveyorJob for Recorder {
        type Args = RecorderArgs;

        fn metadata() -> JobMetadata {
            JobMetadata {
                name: "recorder",
                ..Default::default()
            }
        }

        fn generate_job_id(args: &Self::Args) -> String {
            args.label.clone()
        }

        fn execute(
            _ctx: &JobContext,
            args: Self::Args,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(record_run(args))
        }
    }

    struct ExclusiveRecorder;

    impl ConveyorJob for ExclusiveRecorder {
        type Args = RecorderArgs;

        fn metadata() -> JobMetadata {
            JobMetadata {
                name: "exclusive_recorder",
                overlap: OverlapBehavior::NoOverlap,
                ..Default::default()
            }
        }

        fn execute(
            _ctx: &JobContext,
            args: Self::Args,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(record_run(args))
        }
    }

    fn registry() -> Arc<JobRegistry> {
        let mut registry = JobRegistry::new();
        registry.register::<Recorder>();
        registry.register::<ExclusiveRecorder>();
        Arc::new(registry)
    }

    fn worker(broker: &Arc<MemoryBroker>, id: &str, queue: QueueConfig) -> Worker {
        let mut options = WorkerOptions::new(id, vec![queue]);
        options.poll_interval = Duration::from_millis(20);
        options.drain_timeout = Duration::from_secs(5);
        options.heartbeat = None;
        Worker::new(
            Arc::new(MemoryTransport::new(broker.clone())),
            registry(),
            options,
        )
    }

    fn recorder(name: &str, test: &str, label: &str, sleep_ms: u64, fail: bool) -> Job {
        Job::builder(name)
            .id(label)
            .args(serde_json::json!({
                "test": test,
                "label": label,
                "sleep_ms": sleep_ms,
                "fail": fail,
            }))
            .build()
    }

    fn priority(priority: i32) -> JobOptions {
        JobOptions {
            priority: Some(priority),
            ..Default::default()
        }
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_unknown_queue_rejected() {
        let broker = MemoryBroker::new();
        let worker = worker(&broker, "w-unknown", QueueConfig::new("default"));
        let err = worker
            .add_job("missing", recorder("recorder", "unknown", "a", 0, false), &JobOptions::default())
            .unwrap_err();
        assert!(matches!(err, ConveyorError::NotFound(_)));
        assert!(worker.set_concurrency("missing", 2).is_err());
    }

    #[tokio::test]
    async fn test_priority_order() {
        let broker = MemoryBroker::new();
        let worker = worker(&broker, "w-order", QueueConfig::new("default"));

        worker
            .add_job("default", recorder("recorder", "order", "A", 0, false), &priority(5))
            .unwrap();
        worker
            .add_job("default", recorder("recorder", "order", "B", 0, false), &priority(1))
            .unwrap();
        worker
            .add_job("default", recorder("recorder", "order", "C", 0, false), &priority(5))
            .unwrap();

        worker.start().await.unwrap();
        assert!(worker.wait_idle(Duration::from_secs(5)).await);

        let starts: Vec<String> = events("order")
            .into_iter()
            .filter(|e| e.starts_with("start:"))
            .collect();
        assert_eq!(starts, vec!["start:B", "start:A", "start:C"]);
        worker.stop(false).await.unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_retry_until_exhausted() {
        let broker = MemoryBroker::new();
        let observer = MemoryTransport::new(broker.clone());
        let mut notifications = observer.subscribe();
        let worker = worker(
            &broker,
            "w-retry",
            QueueConfig::new("default").with_retry_delay(Duration::from_millis(10)),
        );

        let job = recorder("recorder", "retry", "flaky", 0, true);
        let handle = job.clone();
        let options = JobOptions {
            max_retries: Some(2),
            ..Default::default()
        };
        worker.add_job("default", job, &options).unwrap();
        worker.start().await.unwrap();
        assert!(worker.wait_idle(Duration::from_secs(5)).await);

        assert_eq!(handle.status(), JobStatus::Failed);
        assert_eq!(handle.retries(), 2);
        assert_eq!(events("retry").len(), 6);

        let mut scheduled = 0;
        let mut last = None;
        while let Ok(notification) = notifications.try_recv() {
            if let TransportNotification::StatusChanged(info) = notification {
                if info.status == JobStatus::ScheduledForRetry {
                    scheduled += 1;
                }
                last = Some(info);
            }
        }
        assert_eq!(scheduled, 2);
        let last = last.unwrap();
        assert_eq!(last.status, JobStatus::Failed);
        assert_eq!(last.retries, 2);
        assert_eq!(last.error.as_deref(), Some("recorder failed"));

        worker.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_graceful_stop_drains() {
        let broker = MemoryBroker::new();
        let worker = worker(&broker, "w-drain", QueueConfig::new("default"));

        let jobs: Vec<Job> = (0..4)
            .map(|i| recorder("recorder", "drain", &format!("job-{}", i), 100, false))
            .collect();
        for (i, job) in jobs.iter().enumerate() {
            worker
                .add_job("default", job.clone(), &priority(i as i32))
                .unwrap();
        }

        worker.start().await.unwrap();
        assert!(
            eventually(|| worker.queue_stats("default").is_some_and(|s| s.active == 1)).await
        );

        worker.stop(false).await.unwrap();

        assert_eq!(jobs[0].status(), JobStatus::Completed);
        for job in &jobs[1..] {
            assert_eq!(job.status(), JobStatus::Cancelled);
        }
        assert_eq!(events("drain"), vec!["start:job-0", "end:job-0"]);

        let err = worker
            .add_job("default", recorder("recorder", "drain", "late", 0, false), &JobOptions::default())
            .unwrap_err();
        assert!(matches!(err, ConveyorError::Draining(_)));
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_no_overlap_across_workers() {
        let broker = MemoryBroker::new();
        let queue = QueueConfig::new("exclusive").with_concurrency(4);
        let a = worker(&broker, "w-overlap-a", queue.clone());
        let b = worker(&broker, "w-overlap-b", queue);

        for i in 0..3 {
            a.add_job(
                "exclusive",
                recorder("exclusive_recorder", "overlap", "shared", 30, false),
                &priority(i),
            )
            .unwrap();
            b.add_job(
                "exclusive",
                recorder("exclusive_recorder", "overlap", "shared", 30, false),
                &priority(i),
            )
            .unwrap();
        }

        a.start().await.unwrap();
        b.start().await.unwrap();
        assert!(a.wait_idle(Duration::from_secs(10)).await);
        assert!(b.wait_idle(Duration::from_secs(10)).await);

        let starts = events("overlap")
            .iter()
            .filter(|e| e.starts_with("start:"))
            .count();
        assert_eq!(starts, 6);
        assert_eq!(max_parallel("overlap"), 1);

        a.stop(false).await.unwrap();
        b.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_overlap_comes_from_job_metadata() {
        let broker = MemoryBroker::new();
        let worker = worker(
            &broker,
            "w-exclusive",
            QueueConfig::new("default").with_concurrency(3),
        );
        for _ in 0..3 {
            worker
                .add_job(
                    "default",
                    recorder("exclusive_recorder", "exclusive-default", "shared", 30, false),
                    &JobOptions::default(),
                )
                .unwrap();
        }

        worker.start().await.unwrap();
        assert!(worker.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(events("exclusive-default").len(), 6);
        assert_eq!(max_parallel("exclusive-default"), 1);
        worker.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_deferred_release_keeps_later_dispatch_lock() {
        let broker = MemoryBroker::new();
        let observer = MemoryTransport::new(broker.clone());
        observer.connect().await.unwrap();

        let mut options = WorkerOptions::new(
            "w-holder",
            vec![QueueConfig::new("exclusive").with_concurrency(2)],
        );
        options.poll_interval = Duration::from_millis(20);
        options.lock_ttl = Duration::from_millis(400);
        options.heartbeat = None;
        let worker = Worker::new(
            Arc::new(MemoryTransport::new(broker.clone())),
            registry(),
            options,
        );

        let first = JobOptions {
            priority: Some(0),
            overlap_delay_ms: Some(600),
            ..Default::default()
        };
        worker
            .add_job(
                "exclusive",
                recorder("exclusive_recorder", "holder", "shared", 0, false),
                &first,
            )
            .unwrap();
        worker
            .add_job(
                "exclusive",
                recorder("exclusive_recorder", "holder", "shared", 1000, false),
                &priority(1),
            )
            .unwrap();

        let started = Instant::now();
        worker.start().await.unwrap();
        assert!(eventually(|| events("holder").len() == 3).await);

        // The first lock expired and the second dispatch holds a fresh one
        // when the first dispatch's deferred release fires.
        tokio::time::sleep_until(started + Duration::from_millis(700)).await;
        assert!(observer.is_job_locked("exclusive", "shared").await.unwrap());

        assert!(worker.wait_idle(Duration::from_secs(5)).await);
        worker.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_allow_overlap_runs_concurrently() {
        let broker = MemoryBroker::new();
        let worker = worker(
            &broker,
            "w-parallel",
            QueueConfig::new("default").with_concurrency(3),
        );
        for _ in 0..3 {
            worker
                .add_job(
                    "default",
                    recorder("recorder", "parallel", "same-id", 100, false),
                    &JobOptions::default(),
                )
                .unwrap();
        }

        worker.start().await.unwrap();
        assert!(worker.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(max_parallel("parallel"), 3);
        worker.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_waiting_job() {
        let broker = MemoryBroker::new();
        let worker = worker(&broker, "w-cancel", QueueConfig::new("default"));
        let running = recorder("recorder", "cancel", "running", 100, false);
        let waiting = recorder("recorder", "cancel", "waiting", 0, false);
        worker
            .add_job("default", running.clone(), &priority(0))
            .unwrap();
        worker
            .add_job("default", waiting.clone(), &priority(1))
            .unwrap();

        worker.start().await.unwrap();
        assert!(
            eventually(|| worker.queue_stats("default").is_some_and(|s| s.active == 1)).await
        );

        assert_eq!(worker.cancel_job("default", "waiting", None).await, 1);
        assert_eq!(worker.cancel_job("default", "waiting", None).await, 0);
        assert!(worker.wait_idle(Duration::from_secs(5)).await);

        assert_eq!(waiting.status(), JobStatus::Cancelled);
        assert_eq!(running.status(), JobStatus::Completed);
        assert!(!events("cancel").contains(&"start:waiting".to_string()));
        worker.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_on_error_pauses_queue() {
        let broker = MemoryBroker::new();
        let worker = worker(
            &broker,
            "w-pause",
            QueueConfig::new("default")
                .with_max_retries(0)
                .with_pause_on_error(true),
        );
        worker.start().await.unwrap();

        worker
            .add_job("default", recorder("recorder", "pause", "bad", 0, true), &JobOptions::default())
            .unwrap();
        assert!(worker.wait_idle(Duration::from_secs(5)).await);
        assert!(worker.queue_stats("default").unwrap().paused);
        assert_eq!(worker.state(), WorkerState::Paused);

        worker
            .add_job("default", recorder("recorder", "pause", "next", 0, false), &JobOptions::default())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(worker.queue_stats("default").unwrap().waiting, 1);

        worker.resume(Some("default")).unwrap();
        assert!(worker.wait_idle(Duration::from_secs(5)).await);
        assert!(events("pause").contains(&"end:next".to_string()));
        worker.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_paused_only_once_active_jobs_finish() {
        let broker = MemoryBroker::new();
        let worker = worker(&broker, "w-paused-state", QueueConfig::new("default"));
        worker.start().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Idle);

        worker
            .add_job("default", recorder("recorder", "paused-state", "slow", 300, false), &JobOptions::default())
            .unwrap();
        assert!(eventually(|| events("paused-state").len() == 1).await);
        worker.pause(None).unwrap();
        assert_eq!(worker.state(), WorkerState::Active);

        assert!(worker.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(worker.state(), WorkerState::Paused);
        worker.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_draining_one_queue_drains_worker() {
        let broker = MemoryBroker::new();
        let mut options = WorkerOptions::new(
            "w-drain-one",
            vec![QueueConfig::new("a"), QueueConfig::new("b")],
        );
        options.poll_interval = Duration::from_millis(20);
        options.heartbeat = None;
        let worker = Worker::new(
            Arc::new(MemoryTransport::new(broker.clone())),
            registry(),
            options,
        );
        worker.start().await.unwrap();

        worker.drain(Some("a")).await.unwrap();
        assert_eq!(worker.state(), WorkerState::Draining);

        worker.resume(Some("a")).unwrap();
        assert_eq!(worker.state(), WorkerState::Idle);
        worker.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_set_concurrency_launches_more() {
        let broker = MemoryBroker::new();
        let worker = worker(&broker, "w-scale", QueueConfig::new("default"));
        for i in 0..3 {
            worker
                .add_job(
                    "default",
                    recorder("recorder", "scale", &format!("job-{}", i), 200, false),
                    &JobOptions::default(),
                )
                .unwrap();
        }
        worker.start().await.unwrap();
        assert!(
            eventually(|| worker.queue_stats("default").is_some_and(|s| s.active == 1)).await
        );

        assert_eq!(worker.set_concurrency("default", 3).unwrap(), 3);
        assert!(
            eventually(|| worker.queue_stats("default").is_some_and(|s| s.active == 3)).await
        );
        assert_eq!(worker.set_concurrency("default", 0).unwrap(), 1);
        worker.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_consumes_dispatched_events() {
        let broker = MemoryBroker::new();
        let worker = worker(&broker, "w-consume", QueueConfig::new("default"));
        worker.start().await.unwrap();

        let producer = MemoryTransport::new(broker.clone());
        producer.connect().await.unwrap();

        let known = ProcessEvent {
            job: "recorder".into(),
            args: serde_json::json!({"test": "consume", "label": "remote"}),
            job_id: "remote".into(),
            dispatch_id: Uuid::new_v4(),
            queue: "default".into(),
            options: JobOptions::default(),
        };
        let unknown = ProcessEvent {
            job: "nope".into(),
            job_id: "ghost".into(),
            dispatch_id: Uuid::new_v4(),
            ..known.clone()
        };
        let known_key = JobKey::new("default", "remote", known.dispatch_id);
        let unknown_key = JobKey::new("default", "ghost", unknown.dispatch_id);

        producer
            .send(TransportEvent::JobProcess(known))
            .await
            .unwrap();
        producer
            .send(TransportEvent::JobProcess(unknown))
            .await
            .unwrap();

        assert!(eventually(|| events("consume").contains(&"end:remote".to_string())).await);
        assert!(worker.wait_idle(Duration::from_secs(5)).await);

        let mut completed = false;
        for _ in 0..50 {
            let info = producer.get_job_status(&known_key).await.unwrap().unwrap();
            if info.status == JobStatus::Completed {
                completed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(completed);

        let ghost = producer.get_job_status(&unknown_key).await.unwrap().unwrap();
        assert_eq!(ghost.status, JobStatus::Failed);
        assert!(ghost.error.unwrap().contains("nope"));

        worker.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_force_stop_cancels_everything() {
        let broker = MemoryBroker::new();
        let worker = worker(&broker, "w-force", QueueConfig::new("default"));
        let slow = recorder("recorder", "force", "slow", 300, false);
        let queued = recorder("recorder", "force", "queued", 0, false);
        worker.add_job("default", slow.clone(), &priority(0)).unwrap();
        worker.add_job("default", queued.clone(), &priority(1)).unwrap();

        worker.start().await.unwrap();
        assert!(
            eventually(|| worker.queue_stats("default").is_some_and(|s| s.active == 1)).await
        );
        worker.stop(true).await.unwrap();

        assert_eq!(slow.status(), JobStatus::Cancelled);
        assert_eq!(queued.status(), JobStatus::Cancelled);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_start_fails_when_broker_down() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let worker = worker(&broker, "w-down", QueueConfig::new("default"));
        assert!(matches!(
            worker.start().await,
            Err(ConveyorError::Transport(_))
        ));
    }

    #[test]
    fn test_options_from_config() {
        let config = ConveyorConfig::in_memory();
        let options = WorkerOptions::from_config(&config, "w-1");
        assert_eq!(options.queues.len(), 1);
        assert_eq!(options.queues[0].name, DEFAULT_QUEUE);
        assert_eq!(options.poll_interval, Duration::from_millis(500));
        assert!(options.maintenance.is_some());
    }
}
