use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conveyor_core::config::MaintenanceConfig;
use conveyor_core::transport::{MaintenancePolicy, MaintenanceReport, Transport};
use tokio::sync::watch;

/// Queue name of the broker lock guarding maintenance.
pub const SYSTEM_QUEUE: &str = "_system";

/// Job id of the broker lock guarding maintenance.
pub const MAINTENANCE_LOCK_ID: &str = "maintenance";

/// Maintenance loop configuration.
#[derive(Debug, Clone)]
pub struct MaintenanceLoopConfig {
    /// Interval between passes.
    pub interval: Duration,
    pub policy: MaintenancePolicy,
}

impl Default for MaintenanceLoopConfig {
    fn default() -> Self {
        Self::from(&MaintenanceConfig::default())
    }
}

impl From<&MaintenanceConfig> for MaintenanceLoopConfig {
    fn from(config: &MaintenanceConfig) -> Self {
        Self {
            interval: config.interval(),
            policy: MaintenancePolicy {
                stream_max_len: config.stream_max_len,
                retention: config.retention(),
            },
        }
    }
}

/// Periodic stream trimming and record purging.
///
/// Every worker runs one; the broker lock lets a single worker do the work
/// per interval.
pub struct MaintenanceLoop {
    transport: Arc<dyn Transport>,
    holder: String,
    config: MaintenanceLoopConfig,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MaintenanceLoop {
    /// Create a new maintenance loop.
    pub fn new(
        transport: Arc<dyn Transport>,
        holder: impl Into<String>,
        config: MaintenanceLoopConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            transport,
            holder: holder.into(),
            config,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Check if the loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the maintenance loop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run the maintenance loop.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    match self.run_once().await {
                        Ok(Some(report)) if report.total() > 0 => {
                            tracing::info!(
                                trimmed = report.trimmed_records,
                                purged = report.purged_statuses,
                                locks = report.expired_locks,
                                workers = report.expired_workers,
                                "Broker maintenance completed"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("Broker maintenance failed: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::debug!("Maintenance loop shutting down");
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    /// One pass. Returns `None` when another worker holds the lock.
    ///
    /// The lock is left to expire shortly before the next tick.
    pub async fn run_once(&self) -> conveyor_core::Result<Option<MaintenanceReport>> {
        let ttl = self.config.interval.mul_f64(0.9);
        let acquired = self
            .transport
            .acquire_job_lock(SYSTEM_QUEUE, MAINTENANCE_LOCK_ID, &self.holder, ttl)
            .await?;
        if !acquired {
            return Ok(None);
        }

        self.transport
            .run_maintenance(self.config.policy)
            .await
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryBroker, MemoryTransport};

    #[test]
    fn test_config_from_maintenance_section() {
        let config = MaintenanceLoopConfig::from(&MaintenanceConfig {
            interval_secs: 5,
            stream_max_len: 10,
            retention_secs: 60,
            status_ttl_secs: 600,
        });
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.policy.stream_max_len, 10);
        assert_eq!(config.policy.retention, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_only_one_holder_per_interval() {
        let broker = MemoryBroker::new();
        let ta = Arc::new(MemoryTransport::new(broker.clone()));
        let tb = Arc::new(MemoryTransport::new(broker));
        ta.connect().await.unwrap();
        tb.connect().await.unwrap();
        let a = MaintenanceLoop::new(ta, "worker-a", MaintenanceLoopConfig::default());
        let b = MaintenanceLoop::new(
            tb,
            "worker-b",
            MaintenanceLoopConfig::default(),
        );

        assert!(a.run_once().await.unwrap().is_some());
        assert!(b.run_once().await.unwrap().is_none());
    }
}
