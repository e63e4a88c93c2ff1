use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conveyor_core::transport::TransportNotification;
use conveyor_core::{ConveyorError, Result};
use sqlx::postgres::PgListener;
use tokio::sync::{broadcast, watch};

use super::signal::Signal;

/// Fans broker signals received over LISTEN/NOTIFY out to local subscribers.
pub struct SignalListener {
    pool: sqlx::PgPool,
    channel: String,
    running: Arc<AtomicBool>,
    signals: broadcast::Sender<Signal>,
    notifications: broadcast::Sender<TransportNotification>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SignalListener {
    pub fn new(
        pool: sqlx::PgPool,
        channel: String,
        signals: broadcast::Sender<Signal>,
        notifications: broadcast::Sender<TransportNotification>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool,
            channel,
            running: Arc::new(AtomicBool::new(false)),
            signals,
            notifications,
            shutdown_rx,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run until shutdown is signalled.
    pub async fn run(&self) -> Result<()> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| ConveyorError::Transport(format!("Failed to open listener: {}", e)))?;
        listener
            .listen(&self.channel)
            .await
            .map_err(|e| ConveyorError::Transport(format!("Failed to listen: {}", e)))?;

        self.running.store(true, Ordering::SeqCst);
        tracing::debug!(channel = %self.channel, "Listening for broker signals");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                notification = listener.recv() => match notification {
                    Ok(notification) => self.dispatch(notification.payload()),
                    Err(e) => {
                        tracing::warn!("Error receiving broker signal: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn dispatch(&self, payload: &str) {
        match Signal::decode(payload) {
            Ok(signal) => {
                if let Some(notification) = signal.notification() {
                    let _ = self.notifications.send(notification);
                }
                let _ = self.signals.send(signal);
            }
            Err(e) => tracing::warn!("Ignoring malformed broker signal: {}", e),
        }
    }
}
