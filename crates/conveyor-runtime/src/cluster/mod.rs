mod heartbeat;
mod maintenance;

pub use heartbeat::{HeartbeatConfig, HeartbeatLoop};
pub use maintenance::{MaintenanceLoop, MaintenanceLoopConfig, MAINTENANCE_LOCK_ID, SYSTEM_QUEUE};
