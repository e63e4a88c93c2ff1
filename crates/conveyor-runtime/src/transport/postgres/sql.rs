//! Queries issued by the postgres transport and row conversion.

use chrono::{DateTime, Utc};
use conveyor_core::job::JobStatus;
use conveyor_core::transport::{JobStatusInfo, WireRecord};
use conveyor_core::{ConveyorError, Result};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

pub const APPEND: &str = r#"
    INSERT INTO conveyor_stream (queue, event_type, record, priority)
    VALUES ($1, $2, $3, $4)
    RETURNING id
"#;

/// Claim unacknowledged records that are unclaimed or whose claim timed out.
pub const CLAIM: &str = r#"
    WITH next AS (
        SELECT id FROM conveyor_stream
        WHERE queue = ANY($1)
          AND acked_at IS NULL
          AND (claimed_at IS NULL OR claimed_at < NOW() - make_interval(secs => $3))
        ORDER BY id
        LIMIT $4
        FOR UPDATE SKIP LOCKED
    )
    UPDATE conveyor_stream s
    SET claimed_by = $2, claimed_at = NOW()
    FROM next
    WHERE s.id = next.id
    RETURNING s.id, s.queue, s.record::text
"#;

pub const ACK: &str = "UPDATE conveyor_stream SET acked_at = NOW() WHERE id = $1";

/// Drop undelivered `job:process` records matched by a cancel.
pub const CANCEL_UNCLAIMED: &str = r#"
    UPDATE conveyor_stream
    SET acked_at = NOW()
    WHERE queue = $1
      AND event_type = 'job:process'
      AND acked_at IS NULL
      AND claimed_at IS NULL
      AND ($2::text IS NULL OR record->>'jobId' = $2)
      AND ($3::text IS NULL OR record->>'dispatchId' = $3)
    RETURNING record->>'jobId', record->>'dispatchId'
"#;

/// Priority is fixed at dispatch; later writes keep it.
pub const UPSERT_STATUS: &str = r#"
    INSERT INTO conveyor_job_status (
        queue, job_id, dispatch_id, status, priority, error, retries, message_id,
        created_at, started_at, completed_at, updated_at, expires_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW() + make_interval(secs => $13))
    ON CONFLICT (queue, job_id, dispatch_id) DO UPDATE SET
        status = EXCLUDED.status,
        error = EXCLUDED.error,
        retries = EXCLUDED.retries,
        message_id = COALESCE(EXCLUDED.message_id, conveyor_job_status.message_id),
        started_at = EXCLUDED.started_at,
        completed_at = EXCLUDED.completed_at,
        updated_at = EXCLUDED.updated_at,
        expires_at = EXCLUDED.expires_at
"#;

pub const GET_STATUS: &str = r#"
    SELECT queue, job_id, dispatch_id, status, error, retries, message_id,
           created_at, started_at, completed_at, updated_at
    FROM conveyor_job_status
    WHERE queue = $1 AND job_id = $2 AND dispatch_id = $3 AND expires_at > NOW()
"#;

pub const FIND_STATUSES: &str = r#"
    SELECT queue, job_id, dispatch_id, status, error, retries, message_id,
           created_at, started_at, completed_at, updated_at
    FROM conveyor_job_status
    WHERE queue = $1 AND job_id = $2 AND expires_at > NOW()
    ORDER BY COALESCE(updated_at, created_at) DESC
"#;

pub const LIST_JOBS: &str = r#"
    SELECT queue, job_id, dispatch_id, status, error, retries, message_id,
           created_at, started_at, completed_at, updated_at
    FROM conveyor_job_status
    WHERE queue = $1 AND status = $2 AND expires_at > NOW()
    ORDER BY priority, created_at
    LIMIT $3
"#;

/// Returns a row only when the lock was taken.
pub const ACQUIRE_LOCK: &str = r#"
    INSERT INTO conveyor_locks (queue, job_id, holder, expires_at)
    VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
    ON CONFLICT (queue, job_id) DO UPDATE SET
        holder = EXCLUDED.holder,
        expires_at = EXCLUDED.expires_at
    WHERE conveyor_locks.expires_at < NOW()
    RETURNING holder
"#;

pub const RELEASE_LOCK: &str =
    "DELETE FROM conveyor_locks WHERE queue = $1 AND job_id = $2 AND holder = $3";

pub const IS_LOCKED: &str = r#"
    SELECT EXISTS (
        SELECT 1 FROM conveyor_locks
        WHERE queue = $1 AND job_id = $2 AND expires_at > NOW()
    )
"#;

pub const REGISTER_WORKER: &str = r#"
    INSERT INTO conveyor_workers (worker_id, registration, expires_at)
    VALUES ($1, $2, NOW() + make_interval(secs => $3))
    ON CONFLICT (worker_id) DO UPDATE SET
        registration = EXCLUDED.registration,
        expires_at = EXCLUDED.expires_at
"#;

pub const UNREGISTER_WORKER: &str =
    "DELETE FROM conveyor_workers WHERE worker_id = $1 RETURNING registration::text";

pub const LIST_WORKERS: &str = r#"
    SELECT registration::text FROM conveyor_workers
    WHERE expires_at > NOW()
    ORDER BY worker_id
"#;

/// Keep the newest `$1` acknowledged records per queue.
pub const TRIM_STREAMS: &str = r#"
    DELETE FROM conveyor_stream
    WHERE id IN (
        SELECT id FROM (
            SELECT id, ROW_NUMBER() OVER (PARTITION BY queue ORDER BY id DESC) AS rn
            FROM conveyor_stream
            WHERE acked_at IS NOT NULL
        ) ranked
        WHERE rn > $1
    )
"#;

pub const PURGE_STATUSES: &str = r#"
    DELETE FROM conveyor_job_status
    WHERE expires_at <= NOW()
       OR (status IN ('completed', 'failed', 'cancelled')
           AND COALESCE(updated_at, created_at) < NOW() - make_interval(secs => $1))
"#;

pub const EXPIRE_LOCKS: &str = "DELETE FROM conveyor_locks WHERE expires_at <= NOW()";

pub const EXPIRE_WORKERS: &str = "DELETE FROM conveyor_workers WHERE expires_at <= NOW()";

pub const NOTIFY: &str = "SELECT pg_notify($1, $2)";

/// Read a `conveyor_job_status` row in the column order of the status selects.
pub fn status_from_row(row: &PgRow) -> Result<JobStatusInfo> {
    let status: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status).ok_or_else(|| {
        ConveyorError::Serialization(format!("unknown status '{}' in broker", status))
    })?;
    let retries: i32 = row.try_get("retries")?;

    Ok(JobStatusInfo {
        job_id: row.try_get("job_id")?,
        dispatch_id: row.try_get::<Uuid, _>("dispatch_id")?,
        queue: row.try_get("queue")?,
        status,
        error: row.try_get("error")?,
        retries: u32::try_from(retries).unwrap_or(0),
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        updated_at: row.try_get("updated_at")?,
        message_id: row.try_get("message_id")?,
    })
}

/// Parse a stream record stored as JSONB text.
pub fn parse_record(text: &str) -> Result<WireRecord> {
    Ok(serde_json::from_str(text)?)
}

pub fn record_value(record: &WireRecord) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(record)?)
}

/// Interval seconds as bound to `make_interval(secs => ...)`.
pub fn secs(duration: std::time::Duration) -> f64 {
    duration.as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_claim_skips_locked_rows() {
        assert!(CLAIM.contains("FOR UPDATE SKIP LOCKED"));
        assert!(CLAIM.contains("queue = ANY($1)"));
        assert!(CLAIM.contains("acked_at IS NULL"));
    }

    #[test]
    fn test_lock_takeover_only_when_expired() {
        assert!(ACQUIRE_LOCK.contains("ON CONFLICT (queue, job_id) DO UPDATE"));
        assert!(ACQUIRE_LOCK.contains("WHERE conveyor_locks.expires_at < NOW()"));
        assert!(RELEASE_LOCK.contains("holder = $3"));
    }

    #[test]
    fn test_status_upsert_keeps_priority() {
        let update = UPSERT_STATUS
            .split("DO UPDATE SET")
            .nth(1)
            .unwrap_or_default();
        assert!(!update.contains("priority"));
        assert!(update.contains("expires_at = EXCLUDED.expires_at"));
    }

    #[test]
    fn test_purge_lists_every_terminal_status() {
        for status in [
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
            assert!(PURGE_STATUSES.contains(&format!("'{}'", status.as_str())));
        }
        assert!(!PURGE_STATUSES.contains(JobStatus::ScheduledForRetry.as_str()));
    }

    #[test]
    fn test_cancel_only_touches_undelivered_process_records() {
        assert!(CANCEL_UNCLAIMED.contains("event_type = 'job:process'"));
        assert!(CANCEL_UNCLAIMED.contains("claimed_at IS NULL"));
    }

    #[test]
    fn test_record_json() {
        let mut record = WireRecord::new();
        record.insert("type".into(), "job:cancel".into());
        record.insert("queue".into(), "emails".into());

        let value = record_value(&record).unwrap();
        assert_eq!(value["queue"], "emails");
        assert_eq!(parse_record(&value.to_string()).unwrap(), record);
        assert!(parse_record("[1, 2]").is_err());
    }

    #[test]
    fn test_interval_secs() {
        assert_eq!(secs(Duration::from_millis(1500)), 1.5);
    }
}
