pub mod cluster;
pub mod config;
pub mod error;
pub mod job;
pub mod transport;

pub use cluster::{WorkerRegistration, WorkerStatus};
pub use config::{ConveyorConfig, QueueConfig};
pub use error::{ConveyorError, Result};
pub use job::{
    ConveyorJob, DispatchOptions, Job, JobContext, JobMetadata, JobOptions, JobStatus,
    OverlapBehavior, DEFAULT_QUEUE,
};
pub use transport::{
    JobKey, JobStatusInfo, MessageHandler, Transport, TransportEvent, TransportNotification,
};
