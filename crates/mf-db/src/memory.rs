//! In-process job store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use mf_core::{Batch, BatchId, Error, Job, JobId, JobState, Result};
use parking_lot::RwLock;

use crate::store::{Created, JobStore};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    /// Insertion sequence, for stable oldest-first listings.
    order: HashMap<JobId, u64>,
    next_seq: u64,
    batches: HashMap<BatchId, Batch>,
    /// Idempotency key -> most recent job created with it.
    keys: HashMap<String, JobId>,
}

/// [`JobStore`] held in memory behind a single `RwLock`.
///
/// Critical sections are short map operations; no I/O happens under the
/// lock.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn create_job(&self, job: Job) -> Result<Created> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        if let Some(key) = &job.idempotency_key {
            if let Some(existing) = inner.keys.get(key).and_then(|id| inner.jobs.get(id)) {
                if existing.satisfies_idempotency() {
                    return Ok(Created::Existing(existing.clone()));
                }
            }
        }

        if inner.jobs.contains_key(&job.id) {
            return Err(Error::Conflict(format!("job {} already exists", job.id)));
        }

        if let Some(parent) = job.parent_id {
            let batch = inner
                .batches
                .get_mut(&parent)
                .ok_or_else(|| Error::not_found("batch", parent))?;
            batch.child_ids.push(job.id);
        }

        if let Some(key) = &job.idempotency_key {
            inner.keys.insert(key.clone(), job.id);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(job.id, seq);
        inner.jobs.insert(job.id, job.clone());
        Ok(Created::New(job))
    }

    fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.inner.read().jobs.get(&id).cloned())
    }

    fn transition(
        &self,
        id: JobId,
        from: &[JobState],
        apply: &mut dyn FnMut(&mut Job),
    ) -> Result<Option<Job>> {
        let mut inner = self.inner.write();
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&job.state) {
            return Ok(None);
        }
        apply(job);
        Ok(Some(job.clone()))
    }

    fn set_progress(&self, id: JobId, progress: f32) -> Result<bool> {
        let mut inner = self.inner.write();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Running => {
                job.set_progress(progress);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn create_batch(&self, batch: &Batch, children: &[Job]) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if inner.batches.contains_key(&batch.id) {
            return Err(Error::Conflict(format!("batch {} already exists", batch.id)));
        }
        for child in children {
            if child.parent_id != Some(batch.id) {
                return Err(Error::Internal(format!(
                    "job {} is not a child of batch {}",
                    child.id, batch.id
                )));
            }
            if inner.jobs.contains_key(&child.id) {
                return Err(Error::Conflict(format!("job {} already exists", child.id)));
            }
        }

        let mut batch = batch.clone();
        batch.child_ids = children.iter().map(|child| child.id).collect();
        inner.batches.insert(batch.id, batch);
        for child in children {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.order.insert(child.id, seq);
            inner.jobs.insert(child.id, child.clone());
        }
        Ok(())
    }

    fn get_batch(&self, id: BatchId) -> Result<Option<Batch>> {
        Ok(self.inner.read().batches.get(&id).cloned())
    }

    fn list_children(&self, id: BatchId) -> Result<Vec<Job>> {
        let inner = self.inner.read();
        let Some(batch) = inner.batches.get(&id) else {
            return Ok(Vec::new());
        };
        Ok(batch
            .child_ids
            .iter()
            .filter_map(|child| inner.jobs.get(child).cloned())
            .collect())
    }

    fn list_by_state(&self, state: JobState) -> Result<Vec<Job>> {
        let inner = self.inner.read();
        let mut jobs: Vec<(u64, Job)> = inner
            .jobs
            .values()
            .filter(|job| job.state == state)
            .map(|job| (inner.order.get(&job.id).copied().unwrap_or(u64::MAX), job.clone()))
            .collect();
        jobs.sort_by_key(|(seq, _)| *seq);
        Ok(jobs.into_iter().map(|(_, job)| job).collect())
    }

    fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let expired: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|job| job.is_terminal() && job.finished_at.is_some_and(|t| t < cutoff))
            .map(|job| job.id)
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(job) = inner.jobs.remove(&id) {
                inner.order.remove(&id);
                if let Some(key) = &job.idempotency_key {
                    if inner.keys.get(key) == Some(&id) {
                        inner.keys.remove(key);
                    }
                }
                if let Some(parent) = job.parent_id {
                    if let Some(batch) = inner.batches.get_mut(&parent) {
                        batch.child_ids.retain(|c| *c != id);
                    }
                }
                removed.push(job);
            }
        }

        inner
            .batches
            .retain(|_, batch| !(batch.child_ids.is_empty() && batch.created_at < cutoff));

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mf_core::{BlobId, BlobRef, ErrorKind, JobError, JobKind, Params};

    fn job() -> Job {
        Job::new(
            JobKind::ImageConvert,
            Params::default(),
            BlobRef::Memory(BlobId::new()),
            100,
        )
    }

    #[test]
    fn create_and_get() {
        let store = MemoryJobStore::new();
        let created = store.create_job(job()).unwrap();
        assert!(created.is_new());
        let loaded = store.get_job(created.job().id).unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Queued);
    }

    #[test]
    fn claim_is_exclusive() {
        let store = MemoryJobStore::new();
        let id = store.create_job(job()).unwrap().job().id;
        assert!(store.claim(id, "w0").unwrap().is_some());
        assert!(store.claim(id, "w1").unwrap().is_none());
        assert_eq!(store.get_job(id).unwrap().unwrap().worker.as_deref(), Some("w0"));
    }

    #[test]
    fn terminal_jobs_reject_transitions() {
        let store = MemoryJobStore::new();
        let id = store.create_job(job()).unwrap().job().id;
        store.claim(id, "w0").unwrap();
        store
            .fail(id, JobError::new(ErrorKind::NonRetryableEngine, "nope"))
            .unwrap()
            .unwrap();
        assert!(store.complete(id, BlobRef::Memory(BlobId::new())).unwrap().is_none());
        assert!(store.mark_canceled(id).unwrap().is_none());
        assert!(store.requeue(id).unwrap().is_none());
        assert_eq!(store.get_job(id).unwrap().unwrap().state, JobState::Failed);
    }

    #[test]
    fn idempotency_key_returns_live_job() {
        let store = MemoryJobStore::new();
        let first = store
            .create_job(job().with_idempotency_key(Some("abc".into())))
            .unwrap();
        let second = store
            .create_job(job().with_idempotency_key(Some("abc".into())))
            .unwrap();
        assert!(!second.is_new());
        assert_eq!(second.job().id, first.job().id);
    }

    #[test]
    fn idempotency_key_ignores_canceled_job() {
        let store = MemoryJobStore::new();
        let first = store
            .create_job(job().with_idempotency_key(Some("abc".into())))
            .unwrap()
            .into_job();
        store.cancel_queued(first.id).unwrap().unwrap();

        let second = store
            .create_job(job().with_idempotency_key(Some("abc".into())))
            .unwrap();
        assert!(second.is_new());
        assert_ne!(second.job().id, first.id);
    }

    #[test]
    fn batch_with_stray_child_inserts_nothing() {
        let store = MemoryJobStore::new();
        let batch = Batch::new(JobKind::ImageConvert, Params::default());
        let children = vec![job().with_parent(batch.id), job()];
        let err = store.create_batch(&batch, &children).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(store.get_batch(batch.id).unwrap().is_none());
        assert!(store.get_job(children[0].id).unwrap().is_none());
    }

    #[test]
    fn child_requires_batch() {
        let store = MemoryJobStore::new();
        let err = store.create_job(job().with_parent(BatchId::new())).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn children_listed_in_order() {
        let store = MemoryJobStore::new();
        let batch = Batch::new(JobKind::ImageConvert, Params::default());
        let children: Vec<Job> = (0..2).map(|_| job().with_parent(batch.id)).collect();
        store.create_batch(&batch, &children).unwrap();
        let mut ids: Vec<JobId> = children.iter().map(|j| j.id).collect();
        ids.push(store.create_job(job().with_parent(batch.id)).unwrap().job().id);

        let listed: Vec<JobId> = store
            .list_children(batch.id)
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(listed, ids);
        assert_eq!(store.get_batch(batch.id).unwrap().unwrap().child_ids, ids);
    }

    #[test]
    fn reset_orphaned_requeues_running() {
        let store = MemoryJobStore::new();
        let id = store.create_job(job()).unwrap().job().id;
        store.claim(id, "w0").unwrap();
        assert_eq!(store.reset_orphaned().unwrap(), vec![id]);
        let job = store.get_job(id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt_count, 1);
    }

    #[test]
    fn purge_removes_only_old_terminal_jobs() {
        let store = MemoryJobStore::new();
        let done = store.create_job(job()).unwrap().job().id;
        let pending = store.create_job(job()).unwrap().job().id;
        store.claim(done, "w0").unwrap();
        store.complete(done, BlobRef::Memory(BlobId::new())).unwrap();

        let removed = store
            .purge_finished_before(Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, done);
        assert!(store.get_job(done).unwrap().is_none());
        assert!(store.get_job(pending).unwrap().is_some());
    }
}
