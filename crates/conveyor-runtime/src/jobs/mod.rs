mod pool;
mod queue;
mod queue_state;
mod registry;
mod worker;

pub use pool::WorkerPool;
pub use queue::{DispatchReceipt, Queue, QueueRegistry};
pub use queue_state::{QueueState, QueueStats, QueuedJob};
pub use registry::{BoxedIdGenerator, BoxedJobHandler, JobEntry, JobRegistry};
pub use worker::{Worker, WorkerOptions, WorkerState};
