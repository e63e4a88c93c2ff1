//! Conveyor - distributed job queues over a shared broker.
//!
//! Producers dispatch jobs through [`Queue`](conveyor_runtime::jobs::Queue)
//! handles; workers in any number of processes consume them with per-queue
//! concurrency, retries and cross-process overlap locks.

mod runtime;

#[doc(hidden)]
pub use conveyor_core;
pub use conveyor_runtime;

pub use conveyor_runtime::migrations::{Migration, MigrationRunner};

pub use runtime::prelude;
pub use runtime::{Conveyor, ConveyorBuilder};
