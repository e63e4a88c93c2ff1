pub mod cluster;
pub mod jobs;
pub mod migrations;
pub mod transport;

pub use cluster::{HeartbeatLoop, MaintenanceLoop};
pub use jobs::{
    DispatchReceipt, JobRegistry, Queue, QueueRegistry, QueueStats, Worker, WorkerOptions,
    WorkerPool, WorkerState,
};
pub use migrations::{Migration, MigrationRunner};
pub use transport::{
    MemoryBroker, MemoryTransport, PostgresTransport, PostgresTransportConfig,
};
