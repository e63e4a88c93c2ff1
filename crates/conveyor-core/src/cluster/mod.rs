mod worker;

pub use worker::{WorkerRegistration, WorkerStatus};
