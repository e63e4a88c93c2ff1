use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use conveyor_core::job::{Job, JobOptions};
use conveyor_core::{ConveyorError, Result};
use futures::future::join_all;

use super::worker::{Worker, WorkerState};

/// A set of workers in one process.
///
/// Jobs added locally are spread over the workers serving the queue in
/// round-robin order.
pub struct WorkerPool {
    workers: Vec<Worker>,
    cursors: HashMap<String, Arc<AtomicUsize>>,
}

impl WorkerPool {
    pub fn new(workers: Vec<Worker>) -> Self {
        let mut cursors = HashMap::new();
        for worker in &workers {
            for queue in worker.queue_names() {
                cursors
                    .entry(queue)
                    .or_insert_with(|| Arc::new(AtomicUsize::new(0)));
            }
        }
        Self { workers, cursors }
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Hand a job to the next worker serving `queue`.
    pub fn add_job(&self, queue: &str, job: Job, options: &JobOptions) -> Result<()> {
        let serving: Vec<&Worker> = self.workers.iter().filter(|w| w.has_queue(queue)).collect();
        let cursor = self
            .cursors
            .get(queue)
            .filter(|_| !serving.is_empty())
            .ok_or_else(|| ConveyorError::NotFound(format!("queue '{}'", queue)))?;

        let index = cursor.fetch_add(1, Ordering::Relaxed) % serving.len();
        serving[index].add_job(queue, job, options)
    }

    /// Start every worker. Stops at the first failure.
    pub async fn start_all(&self) -> Result<()> {
        for worker in &self.workers {
            worker.start().await?;
        }
        tracing::info!(workers = self.workers.len(), "Worker pool started");
        Ok(())
    }

    /// Stop every worker concurrently.
    pub async fn stop_all(&self, force: bool) -> Result<()> {
        let results = join_all(self.workers.iter().map(|w| w.stop(force))).await;
        for (worker, result) in self.workers.iter().zip(&results) {
            if let Err(e) = result {
                tracing::warn!(worker_id = %worker.id(), "Worker failed to stop cleanly: {}", e);
            }
        }
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    pub fn states(&self) -> Vec<(String, WorkerState)> {
        self.workers
            .iter()
            .map(|w| (w.id().to_string(), w.state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::registry::JobRegistry;
    use crate::jobs::worker::WorkerOptions;
    use crate::transport::{MemoryBroker, MemoryTransport};
    use conveyor_core::config::QueueConfig;
    use std::time::Duration;

    fn pool(size: usize) -> WorkerPool {
        let broker = MemoryBroker::new();
        let registry = Arc::new(JobRegistry::new());
        let workers = (0..size)
            .map(|i| {
                let mut options =
                    WorkerOptions::new(format!("pool-{}", i), vec![QueueConfig::new("default")]);
                options.heartbeat = None;
                options.poll_interval = Duration::from_millis(20);
                Worker::new(
                    Arc::new(MemoryTransport::new(broker.clone())),
                    registry.clone(),
                    options,
                )
            })
            .collect();
        WorkerPool::new(workers)
    }

    #[test]
    fn test_round_robin() {
        let pool = pool(3);
        for i in 0..6 {
            pool.add_job(
                "default",
                Job::new("noop", serde_json::json!({ "i": i })),
                &JobOptions::default(),
            )
            .unwrap();
        }

        for worker in pool.workers() {
            assert_eq!(worker.queue_stats("default").unwrap().waiting, 2);
        }
    }

    #[test]
    fn test_unknown_queue() {
        let pool = pool(2);
        let err = pool
            .add_job("other", Job::new("noop", serde_json::Value::Null), &JobOptions::default())
            .unwrap_err();
        assert!(matches!(err, ConveyorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_start_and_stop_all() {
        let pool = pool(2);
        tokio_test::assert_ok!(pool.start_all().await);
        assert!(pool
            .states()
            .iter()
            .all(|(_, state)| *state == WorkerState::Idle));

        tokio_test::assert_ok!(pool.stop_all(false).await);
        assert!(pool
            .states()
            .iter()
            .all(|(_, state)| *state == WorkerState::Stopped));
    }
}
