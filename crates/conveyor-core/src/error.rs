use thiserror::Error;

/// Core error type for Conveyor operations.
#[derive(Error, Debug)]
pub enum ConveyorError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown queue, job or job type.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Admission into a queue that is draining.
    #[error("Queue '{0}' is draining and does not accept new jobs")]
    Draining(String),

    /// Producer-side transport send failure.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Another holder owns the overlap lock. Never surfaced to callers of the worker.
    #[error("Lock contention on job '{job_id}' in queue '{queue}'")]
    LockContention { job_id: String, queue: String },

    /// Error raised by a job's execute hook.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Broker unavailable or a broker call failed.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),
}

impl ConveyorError {
    /// Whether the error is a transient broker failure worth retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Database(_) | Self::Sql(_) | Self::LockContention { .. }
        )
    }
}

impl From<serde_json::Error> for ConveyorError {
    fn from(e: serde_json::Error) -> Self {
        ConveyorError::Serialization(e.to_string())
    }
}

/// Result type alias using ConveyorError.
pub type Result<T> = std::result::Result<T, ConveyorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ConveyorError::Draining("emails".to_string());
        assert_eq!(
            err.to_string(),
            "Queue 'emails' is draining and does not accept new jobs"
        );

        let err = ConveyorError::LockContention {
            job_id: "report-1".to_string(),
            queue: "reports".to_string(),
        };
        assert!(err.to_string().contains("report-1"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(ConveyorError::Transport("down".into()).is_transient());
        assert!(!ConveyorError::NotFound("queue".into()).is_transient());
        assert!(!ConveyorError::Execution("boom".into()).is_transient());
    }

    #[test]
    fn test_from_serde_json() {
        let err: ConveyorError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, ConveyorError::Serialization(_)));
    }
}
