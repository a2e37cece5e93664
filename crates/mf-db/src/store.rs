//! The job record store abstraction.
//!
//! Every state change goes through [`JobStore::transition`], a per-job
//! compare-and-set: the closure only runs if the job's current state is one
//! of `from`, and the check and the write happen under one lock (memory) or
//! one immediate transaction (SQLite). The lifecycle helpers below are thin
//! wrappers that pick the right `from` set for each edge of the state
//! machine.

use chrono::{DateTime, Utc};
use mf_core::{Batch, BatchId, BlobRef, Job, JobError, JobId, JobState, Result};

/// Outcome of [`JobStore::create_job`].
#[derive(Debug, Clone, PartialEq)]
pub enum Created {
    /// The job was inserted.
    New(Job),
    /// A live job already holds the idempotency key; nothing was inserted.
    Existing(Job),
}

impl Created {
    pub fn job(&self) -> &Job {
        match self {
            Created::New(job) | Created::Existing(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            Created::New(job) | Created::Existing(job) => job,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Created::New(_))
    }
}

/// Persistent home of job and batch records.
pub trait JobStore: Send + Sync {
    /// Insert `job`, unless its idempotency key is held by a queued, running
    /// or succeeded job, in which case that job is returned instead. The
    /// lookup and insert are atomic. A job with a `parent_id` must name an
    /// existing batch and is appended to that batch's children.
    fn create_job(&self, job: Job) -> Result<Created>;

    fn get_job(&self, id: JobId) -> Result<Option<Job>>;

    /// Apply `apply` to the job iff its state is in `from`. Returns the
    /// updated job, or `None` if the job is missing or in another state.
    fn transition(
        &self,
        id: JobId,
        from: &[JobState],
        apply: &mut dyn FnMut(&mut Job),
    ) -> Result<Option<Job>>;

    /// Record progress of a running job. Ignored in any other state.
    fn set_progress(&self, id: JobId, progress: f32) -> Result<bool>;

    /// Insert a batch header together with its children, in order, as one
    /// atomic write. Every child must name `batch` as its parent. Children
    /// carry no idempotency key.
    fn create_batch(&self, batch: &Batch, children: &[Job]) -> Result<()>;

    fn get_batch(&self, id: BatchId) -> Result<Option<Batch>>;

    /// Children of a batch in submission order.
    fn list_children(&self, id: BatchId) -> Result<Vec<Job>>;

    /// Jobs currently in `state`, oldest first.
    fn list_by_state(&self, state: JobState) -> Result<Vec<Job>>;

    /// Remove terminal jobs finished before `cutoff`, and batches created
    /// before it that are left without children. Returns the removed jobs.
    fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>>;

    // -- lifecycle helpers --------------------------------------------------

    /// `queued -> running`. `None` means someone else won, or the job was
    /// canceled or purged.
    fn claim(&self, id: JobId, worker: &str) -> Result<Option<Job>> {
        self.transition(id, &[JobState::Queued], &mut |job| job.claim(worker))
    }

    /// `running -> succeeded`.
    fn complete(&self, id: JobId, result_ref: BlobRef) -> Result<Option<Job>> {
        let mut result_ref = Some(result_ref);
        self.transition(id, &[JobState::Running], &mut |job| {
            if let Some(r) = result_ref.take() {
                job.succeed(r);
            }
        })
    }

    /// `running -> failed`.
    fn fail(&self, id: JobId, error: JobError) -> Result<Option<Job>> {
        self.transition(id, &[JobState::Running], &mut |job| job.fail(error.clone()))
    }

    /// `running -> queued` for a retry.
    fn requeue(&self, id: JobId) -> Result<Option<Job>> {
        self.transition(id, &[JobState::Running], &mut Job::requeue)
    }

    /// `queued -> canceled`.
    fn cancel_queued(&self, id: JobId) -> Result<Option<Job>> {
        self.transition(id, &[JobState::Queued], &mut Job::cancel)
    }

    /// `running -> canceled`, once the worker has stopped the engine.
    fn mark_canceled(&self, id: JobId) -> Result<Option<Job>> {
        self.transition(id, &[JobState::Running], &mut Job::cancel)
    }

    /// Put every `running` job back to `queued`. Used at startup, when no
    /// worker can be holding a claim.
    fn reset_orphaned(&self) -> Result<Vec<JobId>> {
        let mut reset = Vec::new();
        for job in self.list_by_state(JobState::Running)? {
            if self.requeue(job.id)?.is_some() {
                reset.push(job.id);
            }
        }
        Ok(reset)
    }
}
