mod context;
mod lifecycle;
mod options;
mod traits;

pub use context::JobContext;
pub use lifecycle::{Job, JobBuilder, JobSnapshot};
pub use options::{DispatchOptions, JobOptions};
pub use traits::{ConveyorJob, JobMetadata, JobStatus, OverlapBehavior, DEFAULT_QUEUE};
