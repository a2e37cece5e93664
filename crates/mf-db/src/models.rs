//! Row mapping between SQLite and the mf-core records.
//!
//! Columns are read by position; the `*_COLS` constants in the query modules
//! fix the order.

use chrono::{DateTime, SecondsFormat, Utc};
use mf_core::{Batch, BlobRef, Job, JobError, Params};
use rusqlite::types::Type;
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

/// Parse a UUID-based ID from a text column.
fn parse_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    let uuid = Uuid::parse_str(&s).map_err(|e| conversion_err(idx, e))?;
    Ok(T::from(uuid))
}

fn parse_opt_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<T>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(v) => {
            let uuid = Uuid::parse_str(&v).map_err(|e| conversion_err(idx, e))?;
            Ok(Some(T::from(uuid)))
        }
        None => Ok(None),
    }
}

/// Parse a text column through `FromStr` (enums, blob references).
fn parse_text<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_err(idx, e))
}

fn parse_opt_text<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: Option<String> = row.get(idx)?;
    s.map(|v| v.parse().map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn parse_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_opt_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|v| {
        DateTime::parse_from_rfc3339(&v)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

fn parse_params(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Params> {
    let s: String = row.get(idx)?;
    Params::from_json(&s).map_err(|e| conversion_err(idx, e))
}

/// Timestamps are stored as fixed-width RFC 3339 so that text comparison
/// orders them chronologically.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn format_opt_ts(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.as_ref().map(format_ts)
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

pub(crate) fn job_from_row(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let error_kind: Option<mf_core::ErrorKind> = parse_opt_text(row, 10)?;
    let error_message: Option<String> = row.get(11)?;
    let error = error_kind.map(|kind| JobError {
        kind,
        message: error_message.unwrap_or_default(),
    });
    let size_hint: i64 = row.get(4)?;
    let progress: f64 = row.get(8)?;

    Ok(Job {
        id: parse_id(row, 0)?,
        kind: parse_text(row, 1)?,
        params: parse_params(row, 2)?,
        input_ref: parse_text::<BlobRef>(row, 3)?,
        size_hint: size_hint.max(0) as u64,
        priority: parse_text(row, 5)?,
        state: parse_text(row, 6)?,
        attempt_count: row.get(7)?,
        progress: progress as f32,
        worker: row.get(9)?,
        result_ref: parse_opt_text(row, 12)?,
        error,
        parent_id: parse_opt_id(row, 13)?,
        idempotency_key: row.get(14)?,
        created_at: parse_ts(row, 15)?,
        started_at: parse_opt_ts(row, 16)?,
        finished_at: parse_opt_ts(row, 17)?,
    })
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// Batch header; `child_ids` is filled in by the caller.
pub(crate) fn batch_from_row(row: &rusqlite::Row) -> rusqlite::Result<Batch> {
    Ok(Batch {
        id: parse_id(row, 0)?,
        kind: parse_text(row, 1)?,
        params: parse_params(row, 2)?,
        child_ids: Vec::new(),
        created_at: parse_ts(row, 3)?,
    })
}
