use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conveyor_core::config::QueueConfig;
use conveyor_core::job::{Job, JobOptions, OverlapBehavior};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// A job admitted into a worker queue.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job: Job,
    pub queue_name: String,
    pub enqueued_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub priority: i32,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub overlap: OverlapBehavior,
    pub overlap_delay: Option<Duration>,
    /// Lock contention backoff. Not part of the ordering.
    pub(crate) not_before: Option<Instant>,
}

impl QueuedJob {
    pub fn new(job: Job, queue_name: impl Into<String>, options: &JobOptions) -> Self {
        Self {
            job,
            queue_name: queue_name.into(),
            enqueued_at: Utc::now(),
            scheduled_for: options.scheduled_for,
            priority: options.priority(),
            max_retries: options.max_retries,
            retry_delay: options.retry_delay(),
            overlap: options.overlap(),
            overlap_delay: options.overlap_delay(),
            not_before: None,
        }
    }

    pub fn retries(&self) -> u32 {
        self.job.retries()
    }

    pub fn dispatch_id(&self) -> Uuid {
        self.job.dispatch_id()
    }

    /// Whether the job may start at the given instants.
    pub fn is_due(&self, now: DateTime<Utc>, tick: Instant) -> bool {
        self.scheduled_for.map_or(true, |at| at <= now) && self.not_before.map_or(true, |at| at <= tick)
    }
}

/// A job waiting for its retry timer.
#[derive(Debug)]
pub(crate) struct RetryingJob {
    pub queued: QueuedJob,
    pub timer: JoinHandle<()>,
}

/// Counters and flags of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub retrying: usize,
    pub concurrency: usize,
    pub paused: bool,
    pub draining: bool,
}

/// Per-queue bookkeeping owned by a worker.
///
/// Only the worker touches this, and only under its state lock.
#[derive(Debug)]
pub struct QueueState {
    pub(crate) config: QueueConfig,
    waiting: Vec<QueuedJob>,
    active: HashMap<Uuid, QueuedJob>,
    retrying: HashMap<Uuid, RetryingJob>,
    pub(crate) paused: bool,
    pub(crate) draining: bool,
}

impl QueueState {
    pub fn new(mut config: QueueConfig) -> Self {
        config.concurrency = config.concurrency.max(1);
        Self {
            config,
            waiting: Vec::new(),
            active: HashMap::new(),
            retrying: HashMap::new(),
            paused: false,
            draining: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn concurrency(&self) -> usize {
        self.config.concurrency
    }

    /// Clamp to at least one.
    pub fn set_concurrency(&mut self, concurrency: usize) -> usize {
        self.config.concurrency = concurrency.max(1);
        self.config.concurrency
    }

    /// Add to the waiting list and restore its order.
    pub fn enqueue(&mut self, queued: QueuedJob) {
        self.waiting.push(queued);
        self.sort_waiting();
    }

    /// Order the waiting list: priority first, then scheduled time, then
    /// enqueue time. Each pass is stable so earlier keys break ties.
    fn sort_waiting(&mut self) {
        self.waiting.sort_by_key(|q| q.enqueued_at);
        self.waiting
            .sort_by_key(|q| q.scheduled_for.map_or(0, |at| at.timestamp_millis()));
        self.waiting.sort_by_key(|q| q.priority);
    }

    pub fn waiting(&self) -> impl Iterator<Item = &QueuedJob> {
        self.waiting.iter()
    }

    pub fn has_waiting(&self) -> bool {
        !self.waiting.is_empty()
    }

    pub fn available_slots(&self) -> usize {
        self.config.concurrency.saturating_sub(self.active.len())
    }

    /// Move up to `max` due jobs, in order, from waiting to active.
    pub fn take_due(&mut self, max: usize, now: DateTime<Utc>, tick: Instant) -> Vec<QueuedJob> {
        let mut taken = Vec::new();
        let mut i = 0;
        while i < self.waiting.len() && taken.len() < max {
            if self.waiting[i].is_due(now, tick) {
                let queued = self.waiting.remove(i);
                self.active.insert(queued.dispatch_id(), queued.clone());
                taken.push(queued);
            } else {
                i += 1;
            }
        }
        taken
    }

    /// Earliest instant a waiting job becomes due, if any is not due yet.
    pub fn next_wakeup(&self, now: DateTime<Utc>, tick: Instant) -> Option<Instant> {
        self.waiting
            .iter()
            .filter(|q| !q.is_due(now, tick))
            .map(|q| {
                let by_schedule = q
                    .scheduled_for
                    .and_then(|at| (at - now).to_std().ok())
                    .map(|d| tick + d)
                    .unwrap_or(tick);
                let by_backoff = q.not_before.unwrap_or(tick);
                by_schedule.max(by_backoff)
            })
            .min()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_jobs(&self) -> impl Iterator<Item = &QueuedJob> {
        self.active.values()
    }

    /// Remove a finished job from the active set.
    pub fn finish(&mut self, dispatch_id: Uuid) -> Option<QueuedJob> {
        self.active.remove(&dispatch_id)
    }

    /// Put a job that lost a lock race back on the waiting list.
    pub fn requeue_contended(&mut self, mut queued: QueuedJob, backoff_until: Instant) {
        self.active.remove(&queued.dispatch_id());
        queued.not_before = Some(backoff_until);
        self.enqueue(queued);
    }

    /// Clear contention backoff for a job id.
    pub fn lock_released(&mut self, job_id: &str) -> bool {
        let mut any = false;
        for queued in self.waiting.iter_mut().filter(|q| q.job.id() == job_id) {
            any |= queued.not_before.take().is_some();
        }
        any
    }

    pub(crate) fn park_retry(&mut self, queued: QueuedJob, timer: JoinHandle<()>) {
        self.retrying
            .insert(queued.dispatch_id(), RetryingJob { queued, timer });
    }

    pub(crate) fn take_retry(&mut self, dispatch_id: Uuid) -> Option<QueuedJob> {
        self.retrying.remove(&dispatch_id).map(|r| r.queued)
    }

    pub fn retrying_count(&self) -> usize {
        self.retrying.len()
    }

    /// Whether a dispatch is waiting, running or parked here.
    pub fn contains(&self, dispatch_id: Uuid) -> bool {
        self.active.contains_key(&dispatch_id)
            || self.retrying.contains_key(&dispatch_id)
            || self.waiting.iter().any(|q| q.dispatch_id() == dispatch_id)
    }

    /// Jobs in any of the three sets.
    pub fn len(&self) -> usize {
        self.waiting.len() + self.active.len() + self.retrying.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel and remove every waiting job matching `pred`.
    pub fn cancel_waiting<F>(&mut self, pred: F) -> Vec<QueuedJob>
    where
        F: Fn(&QueuedJob) -> bool,
    {
        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.waiting).into_iter().partition(|q| pred(q));
        self.waiting = kept;
        removed.into_iter().filter(|q| q.job.cancel()).collect()
    }

    /// Cancel matching retrying jobs and stop their timers.
    pub fn cancel_retrying<F>(&mut self, pred: F) -> Vec<QueuedJob>
    where
        F: Fn(&QueuedJob) -> bool,
    {
        let ids: Vec<Uuid> = self
            .retrying
            .iter()
            .filter(|(_, r)| pred(&r.queued))
            .map(|(id, _)| *id)
            .collect();

        ids.into_iter()
            .filter_map(|id| self.retrying.remove(&id))
            .filter_map(|r| {
                r.timer.abort();
                r.queued.job.cancel().then_some(r.queued)
            })
            .collect()
    }

    /// Cancel matching active jobs. They stay active until their body returns.
    pub fn cancel_active<F>(&mut self, pred: F) -> Vec<QueuedJob>
    where
        F: Fn(&QueuedJob) -> bool,
    {
        self.active
            .values()
            .filter(|q| pred(q))
            .filter(|q| q.job.cancel())
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            waiting: self.waiting.len(),
            active: self.active.len(),
            retrying: self.retrying.len(),
            concurrency: self.config.concurrency,
            paused: self.paused,
            draining: self.draining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(name: &str, priority: i32) -> QueuedJob {
        let options = JobOptions {
            priority: Some(priority),
            ..Default::default()
        };
        QueuedJob::new(Job::builder(name).id(name).build(), "q", &options)
    }

    fn names(state: &QueueState) -> Vec<String> {
        state.waiting().map(|q| q.job.id().to_string()).collect()
    }

    #[test]
    fn test_priority_dominates_enqueue_order() {
        let mut state = QueueState::new(QueueConfig::new("q"));
        let a = queued("a", 5);
        let mut b = queued("b", 1);
        b.enqueued_at = a.enqueued_at + chrono::Duration::milliseconds(1);
        let mut c = queued("c", 5);
        c.enqueued_at = a.enqueued_at + chrono::Duration::milliseconds(2);

        state.enqueue(a);
        state.enqueue(c);
        state.enqueue(b);
        assert_eq!(names(&state), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_unscheduled_before_scheduled_at_same_priority() {
        let mut state = QueueState::new(QueueConfig::new("q"));
        let mut later = queued("later", 0);
        later.scheduled_for = Some(Utc::now() - chrono::Duration::seconds(1));
        state.enqueue(later);
        state.enqueue(queued("now", 0));
        assert_eq!(names(&state), vec!["now", "later"]);
    }

    #[test]
    fn test_take_due_respects_schedule_and_limit() {
        let mut state = QueueState::new(QueueConfig::new("q").with_concurrency(2));
        let mut future = queued("future", 0);
        future.scheduled_for = Some(Utc::now() + chrono::Duration::hours(1));
        state.enqueue(future);
        state.enqueue(queued("x", 1));
        state.enqueue(queued("y", 2));
        state.enqueue(queued("z", 3));

        let slots = state.available_slots();
        let taken = state.take_due(slots, Utc::now(), Instant::now());
        let ids: Vec<&str> = taken.iter().map(|q| q.job.id()).collect();
        assert_eq!(ids, vec!["x", "y"]);
        assert_eq!(state.active_count(), 2);
        assert_eq!(state.available_slots(), 0);
        assert!(state.next_wakeup(Utc::now(), Instant::now()).is_some());
    }

    #[test]
    fn test_concurrency_clamped() {
        let mut state = QueueState::new(QueueConfig::new("q").with_concurrency(0));
        assert_eq!(state.concurrency(), 1);
        assert_eq!(state.set_concurrency(0), 1);
        assert_eq!(state.set_concurrency(8), 8);
    }

    #[test]
    fn test_cancel_waiting_cancels_jobs() {
        let mut state = QueueState::new(QueueConfig::new("q"));
        let a = queued("a", 0);
        let handle = a.job.clone();
        state.enqueue(a);
        state.enqueue(queued("b", 0));

        let removed = state.cancel_waiting(|q| q.job.id() == "a");
        assert_eq!(removed.len(), 1);
        assert_eq!(handle.status(), conveyor_core::JobStatus::Cancelled);
        assert_eq!(names(&state), vec!["b"]);
    }

    #[test]
    fn test_contention_backoff_and_release() {
        let mut state = QueueState::new(QueueConfig::new("q"));
        state.enqueue(queued("a", 0));
        let tick = Instant::now();
        let taken = state.take_due(1, Utc::now(), tick);
        assert_eq!(state.active_count(), 1);

        state.requeue_contended(taken[0].clone(), tick + Duration::from_secs(60));
        assert_eq!(state.active_count(), 0);
        assert!(state.take_due(1, Utc::now(), tick).is_empty());

        assert!(state.lock_released("a"));
        assert_eq!(state.take_due(1, Utc::now(), tick).len(), 1);
    }
}
