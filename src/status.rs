//! Status and result reads.
//!
//! Everything here reads the store and the blob store only; nothing waits
//! on a worker. Batch state is folded from the children on every read.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use mf_core::events::EventPayload;
use mf_core::{
    aggregate_state, AggregateState, BatchId, Error, Job, JobError, JobId, JobKind, JobState,
    Result,
};

use crate::context::Context;

/// Externally visible snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub progress: f32,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<BatchId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobStatus {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            kind: job.kind,
            state: job.state,
            progress: job.progress,
            attempt_count: job.attempt_count,
            error: job.error.clone(),
            parent_id: job.parent_id,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }
}

/// A batch's derived state with the per-child breakdown, in submission
/// order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStatus {
    pub id: BatchId,
    pub state: AggregateState,
    pub children: Vec<JobStatus>,
}

impl BatchStatus {
    /// Children that ended in `failed`, for callers resubmitting them.
    pub fn failed_children(&self) -> impl Iterator<Item = &JobStatus> {
        self.children
            .iter()
            .filter(|child| child.state == JobState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusView {
    Job(JobStatus),
    Batch(BatchStatus),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultView {
    Ready { output: Bytes },
    /// Any state other than `succeeded`; a failure's error is on the status.
    NotReady { state: JobState },
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was queued and is now `canceled`.
    Canceled,
    /// The job is running; its worker was signaled. The final state is
    /// whatever the worker records.
    Requested,
    /// The job was already terminal; nothing changed.
    AlreadyFinished,
}

pub fn job_status(ctx: &Context, id: JobId) -> Result<JobStatus> {
    ctx.store
        .get_job(id)?
        .map(|job| JobStatus::from(&job))
        .ok_or_else(|| Error::not_found("job", id))
}

pub fn batch_status(ctx: &Context, id: BatchId) -> Result<BatchStatus> {
    if ctx.store.get_batch(id)?.is_none() {
        return Err(Error::not_found("batch", id));
    }
    let children: Vec<JobStatus> = ctx
        .store
        .list_children(id)?
        .iter()
        .map(JobStatus::from)
        .collect();
    Ok(BatchStatus {
        id,
        state: aggregate_state(children.iter().map(|c| c.state)),
        children,
    })
}

/// Resolve `id` as a job first, then as a batch.
pub fn get_status(ctx: &Context, id: Uuid) -> Result<StatusView> {
    if let Some(job) = ctx.store.get_job(JobId::from(id))? {
        return Ok(StatusView::Job(JobStatus::from(&job)));
    }
    match batch_status(ctx, BatchId::from(id)) {
        Ok(batch) => Ok(StatusView::Batch(batch)),
        Err(Error::NotFound { .. }) => Err(Error::not_found("job or batch", id)),
        Err(e) => Err(e),
    }
}

pub async fn get_result(ctx: &Context, id: JobId) -> Result<ResultView> {
    let job = ctx
        .store
        .get_job(id)?
        .ok_or_else(|| Error::not_found("job", id))?;

    match (job.state, &job.result_ref) {
        (JobState::Succeeded, Some(result)) => Ok(ResultView::Ready {
            output: ctx.blobs.read(result).await?,
        }),
        (JobState::Succeeded, None) => Err(Error::Internal(format!(
            "job {id} succeeded without a result"
        ))),
        (state, _) => Ok(ResultView::NotReady { state }),
    }
}

/// Cancel a job: queued jobs are canceled in the store and dropped from the
/// queue; running jobs have their worker signaled.
pub fn cancel(ctx: &Context, id: JobId) -> Result<CancelOutcome> {
    if let Some(job) = ctx.store.cancel_queued(id)? {
        ctx.queue.remove(id);
        ctx.emit(EventPayload::JobCanceled { job_id: id });
        tracing::info!(job_id = %id, kind = %job.kind, "Canceled queued job");
        return Ok(CancelOutcome::Canceled);
    }

    let job = ctx
        .store
        .get_job(id)?
        .ok_or_else(|| Error::not_found("job", id))?;

    match job.state {
        JobState::Running => {
            match ctx.running.get(&id) {
                Some(token) => token.cancel(),
                None => {
                    // The attempt settled between the two reads.
                    let now = ctx.store.get_job(id)?.map(|j| j.state);
                    if now.is_some_and(JobState::is_terminal) {
                        return Ok(CancelOutcome::AlreadyFinished);
                    }
                    tracing::warn!(job_id = %id, "Running job has no live worker to signal");
                }
            }
            tracing::info!(job_id = %id, "Cancel requested for running job");
            Ok(CancelOutcome::Requested)
        }
        // Requeued for a retry between the two reads.
        JobState::Queued => cancel(ctx, id),
        JobState::Succeeded | JobState::Failed | JobState::Canceled => {
            Ok(CancelOutcome::AlreadyFinished)
        }
    }
}
