//! Job record operations.

use chrono::{DateTime, Utc};
use mf_core::{BatchId, Error, Job, JobId, JobState, Result};
use rusqlite::{Connection, OptionalExtension};

use crate::models::{format_opt_ts, format_ts, job_from_row};

pub(crate) const COLS: &str = "id, kind, params, input_ref, size_hint, priority, state,
    attempt_count, progress, worker, error_kind, error_message, result_ref, parent_id,
    idempotency_key, created_at, started_at, finished_at";

/// Insert a new job row. Children of a batch get the next `batch_seq`.
pub fn insert_job(conn: &Connection, job: &Job) -> Result<()> {
    conn.execute(
        "INSERT INTO jobs (id, kind, params, input_ref, size_hint, priority, state,
            attempt_count, progress, worker, error_kind, error_message, result_ref,
            parent_id, batch_seq, idempotency_key, created_at, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
            CASE WHEN ?14 IS NULL THEN NULL
                 ELSE (SELECT COALESCE(MAX(batch_seq), -1) + 1 FROM jobs WHERE parent_id = ?14)
            END,
            ?15, ?16, ?17, ?18)",
        rusqlite::params![
            job.id.to_string(),
            job.kind.as_str(),
            job.params.to_json(),
            job.input_ref.to_string(),
            job.size_hint as i64,
            job.priority.as_str(),
            job.state.as_str(),
            job.attempt_count,
            f64::from(job.progress),
            job.worker,
            job.error.as_ref().map(|e| e.kind.as_str()),
            job.error.as_ref().map(|e| e.message.as_str()),
            job.result_ref.as_ref().map(|r| r.to_string()),
            job.parent_id.map(|p| p.to_string()),
            job.idempotency_key,
            format_ts(&job.created_at),
            format_opt_ts(&job.started_at),
            format_opt_ts(&job.finished_at),
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}

/// Write back every mutable column of an existing job.
pub fn update_job(conn: &Connection, job: &Job) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE jobs SET state=?1, attempt_count=?2, progress=?3, worker=?4,
                error_kind=?5, error_message=?6, result_ref=?7, started_at=?8, finished_at=?9
             WHERE id=?10",
            rusqlite::params![
                job.state.as_str(),
                job.attempt_count,
                f64::from(job.progress),
                job.worker,
                job.error.as_ref().map(|e| e.kind.as_str()),
                job.error.as_ref().map(|e| e.message.as_str()),
                job.result_ref.as_ref().map(|r| r.to_string()),
                format_opt_ts(&job.started_at),
                format_opt_ts(&job.finished_at),
                job.id.to_string(),
            ],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Get a job by ID.
pub fn get_job(conn: &Connection, id: JobId) -> Result<Option<Job>> {
    let q = format!("SELECT {COLS} FROM jobs WHERE id = ?1");
    conn.query_row(&q, [id.to_string()], job_from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// Most recent job with `key` that still answers idempotency lookups.
pub fn find_live_by_key(conn: &Connection, key: &str) -> Result<Option<Job>> {
    let q = format!(
        "SELECT {COLS} FROM jobs
         WHERE idempotency_key = ?1 AND state IN ('queued', 'running', 'succeeded')
         ORDER BY created_at DESC, rowid DESC LIMIT 1"
    );
    conn.query_row(&q, [key], job_from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// Update progress of a running job.
pub fn update_progress(conn: &Connection, id: JobId, progress: f32) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE jobs SET progress = ?1 WHERE id = ?2 AND state = 'running'",
            rusqlite::params![f64::from(progress.clamp(0.0, 1.0)), id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Children of a batch in submission order.
pub fn list_children(conn: &Connection, parent: BatchId) -> Result<Vec<Job>> {
    let q = format!("SELECT {COLS} FROM jobs WHERE parent_id = ?1 ORDER BY batch_seq ASC");
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([parent.to_string()], job_from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Jobs in `state`, oldest first.
pub fn list_by_state(conn: &Connection, state: JobState) -> Result<Vec<Job>> {
    let q = format!("SELECT {COLS} FROM jobs WHERE state = ?1 ORDER BY created_at ASC, rowid ASC");
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([state.as_str()], job_from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Delete terminal jobs that finished before `cutoff`, returning them.
pub fn delete_finished_before(conn: &Connection, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
    let q = format!(
        "DELETE FROM jobs
         WHERE state IN ('succeeded', 'failed', 'canceled') AND finished_at < ?1
         RETURNING {COLS}"
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([format_ts(&cutoff)], job_from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}
