//! Batch header operations.

use chrono::{DateTime, Utc};
use mf_core::{Batch, BatchId, Error, JobId, Result};
use rusqlite::{Connection, OptionalExtension};

use crate::models::{batch_from_row, format_ts};

const COLS: &str = "id, kind, params, created_at";

/// Insert a batch header. Children are linked through `jobs.parent_id`.
pub fn insert_batch(conn: &Connection, batch: &Batch) -> Result<()> {
    conn.execute(
        "INSERT INTO batches (id, kind, params, created_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            batch.id.to_string(),
            batch.kind.as_str(),
            batch.params.to_json(),
            format_ts(&batch.created_at),
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}

pub fn batch_exists(conn: &Connection, id: BatchId) -> Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM batches WHERE id = ?1",
        [id.to_string()],
        |row| row.get(0),
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// Load a batch with its child ids in submission order.
pub fn get_batch(conn: &Connection, id: BatchId) -> Result<Option<Batch>> {
    let q = format!("SELECT {COLS} FROM batches WHERE id = ?1");
    let Some(mut batch) = conn
        .query_row(&q, [id.to_string()], batch_from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))?
    else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare("SELECT id FROM jobs WHERE parent_id = ?1 ORDER BY batch_seq ASC")
        .map_err(|e| Error::database(e.to_string()))?;
    let ids = stmt
        .query_map([id.to_string()], |row| row.get::<_, String>(0))
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    batch.child_ids = ids
        .iter()
        .map(|s| s.parse::<JobId>().map_err(Error::database))
        .collect::<Result<Vec<_>>>()?;

    Ok(Some(batch))
}

/// Delete batches created before `cutoff` that no longer have children.
pub fn delete_empty_before(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
    conn.execute(
        "DELETE FROM batches
         WHERE created_at < ?1
           AND NOT EXISTS (SELECT 1 FROM jobs WHERE jobs.parent_id = batches.id)",
        [format_ts(&cutoff)],
    )
    .map_err(|e| Error::database(e.to_string()))
}
