use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conveyor_core::cluster::{WorkerRegistration, WorkerStatus};
use conveyor_core::transport::Transport;
use tokio::sync::watch;

/// Heartbeat loop configuration.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats.
    pub interval: Duration,
    /// How long a registration survives without a heartbeat.
    pub registration_ttl: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            registration_ttl: Duration::from_secs(30),
        }
    }
}

/// Keeps a worker's membership record alive in the broker.
pub struct HeartbeatLoop {
    transport: Arc<dyn Transport>,
    registration: Mutex<WorkerRegistration>,
    config: HeartbeatConfig,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HeartbeatLoop {
    /// Create a new heartbeat loop.
    pub fn new(
        transport: Arc<dyn Transport>,
        registration: WorkerRegistration,
        config: HeartbeatConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            transport,
            registration: Mutex::new(registration),
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

    /// Stop the heartbeat loop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.running.store(false, Ordering::SeqCst);
    }

    /// Status published with the next heartbeat.
    pub fn set_status(&self, status: WorkerStatus) {
        self.registration().status = status;
    }

    /// Current registration record.
    pub fn snapshot(&self) -> WorkerRegistration {
        self.registration().clone()
    }

    /// Run the heartbeat loop.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.beat().await {
                        tracing::warn!("Failed to send heartbeat: {}", e);
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::debug!("Heartbeat loop shutting down");
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    /// Refresh the registration once.
    pub async fn beat(&self) -> conveyor_core::Result<()> {
        let registration = {
            let mut reg = self.registration();
            reg.touch();
            reg.clone()
        };
        self.transport
            .register_worker(registration, self.config.registration_ttl)
            .await
    }

    fn registration(&self) -> std::sync::MutexGuard<'_, WorkerRegistration> {
        self.registration
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
