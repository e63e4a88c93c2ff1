//! Process entry point.
//!
//! Wires one producer connection, the queue registry and a pool of workers
//! from a [`ConveyorConfig`].

use std::sync::Arc;

use tokio::sync::broadcast;

use conveyor_core::config::{BrokerKind, ConveyorConfig};
use conveyor_core::error::{ConveyorError, Result};
use conveyor_core::job::ConveyorJob;
use conveyor_core::transport::Transport;
use conveyor_runtime::jobs::{JobRegistry, Queue, QueueRegistry, Worker, WorkerOptions, WorkerPool};
use conveyor_runtime::transport::{
    MemoryBroker, MemoryBrokerConfig, MemoryTransport, PostgresTransport, PostgresTransportConfig,
};

/// Prelude module for common imports.
pub mod prelude {
    pub use chrono::{DateTime, Utc};
    pub use uuid::Uuid;

    pub use conveyor_core::config::ConveyorConfig;
    pub use conveyor_core::error::{ConveyorError, Result};
    pub use conveyor_core::job::{
        ConveyorJob, DispatchOptions, JobContext, JobMetadata, JobStatus, OverlapBehavior,
    };
    pub use conveyor_core::transport::JobStatusInfo;
    pub use conveyor_runtime::jobs::{DispatchReceipt, Queue, QueueRegistry};

    pub use crate::{Conveyor, ConveyorBuilder};
}

/// Builds broker connections of the configured kind.
///
/// Workers own their connection, so each one gets its own. Memory
/// connections share one broker.
enum TransportFactory {
    Postgres(PostgresTransportConfig),
    Memory(Arc<MemoryBroker>),
}

impl TransportFactory {
    fn from_config(config: &ConveyorConfig) -> Self {
        match config.broker.kind {
            BrokerKind::Postgres => Self::Postgres(PostgresTransportConfig::from_config(config)),
            BrokerKind::Memory => Self::Memory(MemoryBroker::with_config(MemoryBrokerConfig {
                visibility_timeout: config.broker.visibility_timeout(),
                status_ttl: config.maintenance.status_ttl(),
                registration_ttl: config.worker.registration_ttl(),
            })),
        }
    }

    fn connection(&self) -> Arc<dyn Transport> {
        match self {
            Self::Postgres(config) => Arc::new(PostgresTransport::new(config.clone())),
            Self::Memory(broker) => Arc::new(MemoryTransport::new(broker.clone())),
        }
    }
}

pub struct Conveyor {
    config: ConveyorConfig,
    registry: Arc<JobRegistry>,
    producer: Arc<dyn Transport>,
    queues: QueueRegistry,
    workers: WorkerPool,
    shutdown_tx: broadcast::Sender<()>,
}

impl Conveyor {
    pub fn builder() -> ConveyorBuilder {
        ConveyorBuilder::new()
    }

    pub fn config(&self) -> &ConveyorConfig {
        &self.config
    }

    pub fn job_registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Producer-side queue handles.
    pub fn queues(&self) -> &QueueRegistry {
        &self.queues
    }

    pub fn queue(&self, name: &str) -> Queue {
        self.queues.queue(name)
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// Connect the producer and start every worker.
    pub async fn start(&self) -> Result<()> {
        if !self.producer.is_connected() {
            self.producer.connect().await?;
        }
        self.workers.start_all().await?;
        tracing::info!(
            broker = self.producer.name(),
            workers = self.workers.len(),
            jobs = self.registry.len(),
            "Conveyor started"
        );
        Ok(())
    }

    /// Stop the workers, then the producer connection.
    pub async fn stop(&self, force: bool) -> Result<()> {
        let stopped = self.workers.stop_all(force).await;
        self.producer.disconnect().await?;
        tracing::info!("Conveyor stopped");
        stopped
    }

    /// Start, then run until Ctrl-C or [`Conveyor::shutdown`], then drain.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.start().await?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("Received shutdown notification");
            }
        }

        self.stop(false).await
    }

    /// Ask a running [`Conveyor::run`] to return.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

pub struct ConveyorBuilder {
    config: Option<ConveyorConfig>,
    registry: JobRegistry,
}

impl ConveyorBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            registry: JobRegistry::new(),
        }
    }

    pub fn config(mut self, config: ConveyorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Register a job type.
    pub fn register<J: ConveyorJob>(mut self) -> Self {
        self.registry.register::<J>();
        self
    }

    pub fn job_registry_mut(&mut self) -> &mut JobRegistry {
        &mut self.registry
    }

    pub fn build(self) -> Result<Conveyor> {
        let config = self
            .config
            .ok_or_else(|| ConveyorError::Config("Configuration is required".to_string()))?;
        config.validate()?;

        let registry = Arc::new(self.registry);
        let factory = TransportFactory::from_config(&config);
        let producer = factory.connection();
        let queues = QueueRegistry::new(producer.clone(), registry.clone());

        let hostname = local_hostname();
        let base_id = config
            .worker
            .id
            .clone()
            .unwrap_or_else(|| default_worker_id(&hostname));
        let count = config.worker.count.max(1);

        let workers = (0..count)
            .map(|i| {
                let id = if count == 1 {
                    base_id.clone()
                } else {
                    format!("{}-{}", base_id, i)
                };
                let options = WorkerOptions::from_config(&config, id).with_hostname(&hostname);
                Worker::new(factory.connection(), registry.clone(), options)
            })
            .collect();

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Conveyor {
            config,
            registry,
            producer,
            queues,
            workers: WorkerPool::new(workers),
            shutdown_tx,
        })
    }
}

impl Default for ConveyorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_worker_id(hostname: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", hostname, &suffix[..8])
}
