//! SQLite-backed job store.

use chrono::{DateTime, Utc};
use mf_core::{Batch, BatchId, Error, Job, JobId, JobState, Result};
use rusqlite::TransactionBehavior;
use std::path::Path;

use crate::pool::{get_conn, init_memory_pool, init_pool, DbPool};
use crate::queries::{batches, jobs};
use crate::store::{Created, JobStore};

/// [`JobStore`] over an r2d2 pool of SQLite connections.
///
/// Read-check-write operations run in `BEGIN IMMEDIATE` transactions, so the
/// write lock is taken before the current state is read and two writers can
/// never both observe `queued`.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: DbPool,
}

impl SqliteJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Open (or create) a database file and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(init_pool(path)?))
    }

    /// Private in-memory database.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(init_memory_pool()?))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    fn with_immediate<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<(T, bool)>,
    ) -> Result<T> {
        let mut conn = get_conn(&self.pool)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::database(e.to_string()))?;
        let (value, commit) = f(&tx)?;
        if commit {
            tx.commit().map_err(|e| Error::database(e.to_string()))?;
        }
        Ok(value)
    }
}

impl JobStore for SqliteJobStore {
    fn create_job(&self, job: Job) -> Result<Created> {
        self.with_immediate(|tx| {
            if let Some(key) = &job.idempotency_key {
                if let Some(existing) = jobs::find_live_by_key(tx, key)? {
                    return Ok((Created::Existing(existing), false));
                }
            }
            if let Some(parent) = job.parent_id {
                if !batches::batch_exists(tx, parent)? {
                    return Err(Error::not_found("batch", parent));
                }
            }
            if jobs::get_job(tx, job.id)?.is_some() {
                return Err(Error::Conflict(format!("job {} already exists", job.id)));
            }
            jobs::insert_job(tx, &job)?;
            Ok((Created::New(job), true))
        })
    }

    fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let conn = get_conn(&self.pool)?;
        jobs::get_job(&conn, id)
    }

    fn transition(
        &self,
        id: JobId,
        from: &[JobState],
        apply: &mut dyn FnMut(&mut Job),
    ) -> Result<Option<Job>> {
        self.with_immediate(|tx| {
            let Some(mut job) = jobs::get_job(tx, id)? else {
                return Ok((None, false));
            };
            if !from.contains(&job.state) {
                return Ok((None, false));
            }
            apply(&mut job);
            jobs::update_job(tx, &job)?;
            Ok((Some(job), true))
        })
    }

    fn set_progress(&self, id: JobId, progress: f32) -> Result<bool> {
        let conn = get_conn(&self.pool)?;
        jobs::update_progress(&conn, id, progress)
    }

    fn create_batch(&self, batch: &Batch, children: &[Job]) -> Result<()> {
        self.with_immediate(|tx| {
            batches::insert_batch(tx, batch)?;
            for child in children {
                if child.parent_id != Some(batch.id) {
                    return Err(Error::Internal(format!(
                        "job {} is not a child of batch {}",
                        child.id, batch.id
                    )));
                }
                jobs::insert_job(tx, child)?;
            }
            Ok(((), true))
        })
    }

    fn get_batch(&self, id: BatchId) -> Result<Option<Batch>> {
        let conn = get_conn(&self.pool)?;
        batches::get_batch(&conn, id)
    }

    fn list_children(&self, id: BatchId) -> Result<Vec<Job>> {
        let conn = get_conn(&self.pool)?;
        jobs::list_children(&conn, id)
    }

    fn list_by_state(&self, state: JobState) -> Result<Vec<Job>> {
        let conn = get_conn(&self.pool)?;
        jobs::list_by_state(&conn, state)
    }

    fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        self.with_immediate(|tx| {
            let removed = jobs::delete_finished_before(tx, cutoff)?;
            let batches_removed = batches::delete_empty_before(tx, cutoff)?;
            if !removed.is_empty() || batches_removed > 0 {
                tracing::debug!(
                    jobs = removed.len(),
                    batches = batches_removed,
                    "Purged expired records"
                );
            }
            Ok((removed, true))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mf_core::{BlobId, BlobRef, ErrorKind, JobError, JobKind, Params};
    use std::sync::Arc;

    fn job() -> Job {
        Job::new(
            JobKind::VideoConvert,
            Params {
                format: Some("webm".into()),
                ..Params::default()
            },
            BlobRef::File("/tmp/input.mov".into()),
            200 * 1024 * 1024,
        )
    }

    #[test]
    fn lifecycle_roundtrip() {
        let store = SqliteJobStore::in_memory().unwrap();
        let id = store.create_job(job()).unwrap().job().id;

        let running = store.claim(id, "w0").unwrap().unwrap();
        assert_eq!(running.state, JobState::Running);
        assert_eq!(running.attempt_count, 1);

        let out = BlobRef::Memory(BlobId::new());
        let done = store.complete(id, out.clone()).unwrap().unwrap();
        assert_eq!(done.result_ref, Some(out.clone()));

        let loaded = store.get_job(id).unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Succeeded);
        assert_eq!(loaded.result_ref, Some(out));
        assert!(loaded.error.is_none());
    }

    #[test]
    fn second_claim_loses() {
        let store = SqliteJobStore::in_memory().unwrap();
        let id = store.create_job(job()).unwrap().job().id;
        assert!(store.claim(id, "w0").unwrap().is_some());
        assert!(store.claim(id, "w1").unwrap().is_none());
    }

    #[test]
    fn concurrent_claims_on_file_db_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteJobStore::open(&dir.path().join("jobs.db")).unwrap());
        let id = store.create_job(job()).unwrap().job().id;

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.claim(id, &format!("w{i}")).unwrap().is_some())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(store.get_job(id).unwrap().unwrap().attempt_count, 1);
    }

    #[test]
    fn idempotent_create_is_atomic() {
        let store = SqliteJobStore::in_memory().unwrap();
        let a = store
            .create_job(job().with_idempotency_key(Some("same".into())))
            .unwrap();
        let b = store
            .create_job(job().with_idempotency_key(Some("same".into())))
            .unwrap();
        assert!(a.is_new());
        assert!(!b.is_new());
        assert_eq!(b.job().id, a.job().id);
    }

    #[test]
    fn failed_key_allows_new_job() {
        let store = SqliteJobStore::in_memory().unwrap();
        let first = store
            .create_job(job().with_idempotency_key(Some("k".into())))
            .unwrap()
            .into_job();
        store.claim(first.id, "w0").unwrap();
        store
            .fail(first.id, JobError::new(ErrorKind::NonRetryableEngine, "bad"))
            .unwrap();

        let second = store
            .create_job(job().with_idempotency_key(Some("k".into())))
            .unwrap();
        assert!(second.is_new());
    }

    #[test]
    fn child_of_unknown_batch_rejected() {
        let store = SqliteJobStore::in_memory().unwrap();
        let err = store.create_job(job().with_parent(BatchId::new())).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn batch_children_and_purge() {
        let store = SqliteJobStore::in_memory().unwrap();
        let batch = Batch::new(JobKind::VideoConvert, Params::default());
        let child = job().with_parent(batch.id);
        store.create_batch(&batch, std::slice::from_ref(&child)).unwrap();
        assert_eq!(store.get_batch(batch.id).unwrap().unwrap().child_ids, vec![child.id]);

        store.claim(child.id, "w0").unwrap();
        store.mark_canceled(child.id).unwrap().unwrap();

        let removed = store
            .purge_finished_before(Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert!(store.get_job(child.id).unwrap().is_none());
        assert!(store.get_batch(batch.id).unwrap().is_none());
    }

    #[test]
    fn batch_insert_rolls_back_as_a_whole() {
        let store = SqliteJobStore::in_memory().unwrap();
        let batch = Batch::new(JobKind::VideoConvert, Params::default());
        let first = job().with_parent(batch.id);
        // Same id twice: the second insert hits the primary key.
        let children = vec![first.clone(), first.clone()];
        assert!(store.create_batch(&batch, &children).is_err());
        assert!(store.get_batch(batch.id).unwrap().is_none());
        assert!(store.get_job(first.id).unwrap().is_none());

        store.create_batch(&batch, &[first.clone()]).unwrap();
        assert_eq!(store.get_batch(batch.id).unwrap().unwrap().child_ids, vec![first.id]);
    }

    #[test]
    fn reset_orphaned_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let id = {
            let store = SqliteJobStore::open(&path).unwrap();
            let id = store.create_job(job()).unwrap().job().id;
            store.claim(id, "w0").unwrap();
            id
        };

        let store = SqliteJobStore::open(&path).unwrap();
        assert_eq!(store.reset_orphaned().unwrap(), vec![id]);
        assert_eq!(store.get_job(id).unwrap().unwrap().state, JobState::Queued);
    }
}
