//! Submission: admission, the sync/async decision, and idempotency.
//!
//! Small inputs run inline, awaited by the caller, through the same claim
//! and execute path a pooled worker uses, without touching the queue. Everything
//! else is recorded as `queued`, pushed onto the queue, and answered with a
//! handle.

use bytes::Bytes;
use serde_json::Value;

use mf_core::events::EventPayload;
use mf_core::{
    BlobRef, Error, ErrorKind, Job, JobError, JobId, JobKind, JobState, Priority, RawParams,
    Result,
};
use mf_db::Created;

use crate::context::Context;
use crate::validation::validate;
use crate::worker::{claim_and_execute, Attempt, INLINE_WORKER};

/// Where a job's input comes from.
#[derive(Debug, Clone)]
pub enum Input {
    /// Bytes handed over by the caller; staged into the blob store.
    Bytes(Bytes),
    /// A reference the upload layer already holds.
    Blob(BlobRef),
}

impl From<Bytes> for Input {
    fn from(bytes: Bytes) -> Self {
        Input::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Input {
    fn from(bytes: Vec<u8>) -> Self {
        Input::Bytes(Bytes::from(bytes))
    }
}

impl From<BlobRef> for Input {
    fn from(blob: BlobRef) -> Self {
        Input::Blob(blob)
    }
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub kind: JobKind,
    pub params: RawParams,
    pub input: Input,
    /// Declared input size in bytes.
    pub size_hint: u64,
    pub idempotency_key: Option<String>,
    pub force_async: bool,
    pub priority: Priority,
}

impl SubmitRequest {
    /// A request with no parameters. For byte inputs the size hint is the
    /// byte length; for references it starts at zero.
    pub fn new(kind: JobKind, input: impl Into<Input>) -> Self {
        let input = input.into();
        let size_hint = match &input {
            Input::Bytes(bytes) => bytes.len() as u64,
            Input::Blob(_) => 0,
        };
        Self {
            kind,
            params: RawParams::new(),
            input,
            size_hint,
            idempotency_key: None,
            force_async: false,
            priority: Priority::default(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn params(mut self, params: RawParams) -> Self {
        self.params = params;
        self
    }

    pub fn size_hint(mut self, size_hint: u64) -> Self {
        self.size_hint = size_hint;
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn force_async(mut self, force_async: bool) -> Self {
        self.force_async = force_async;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Answer to a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Ran inline (or matched a succeeded job by key); the output is here.
    Completed { job_id: JobId, output: Bytes },
    /// Queued or already in flight; poll the status API.
    Accepted { job_id: JobId },
}

impl Submission {
    pub fn job_id(&self) -> JobId {
        match self {
            Submission::Completed { job_id, .. } | Submission::Accepted { job_id } => *job_id,
        }
    }
}

pub async fn submit(ctx: &Context, req: SubmitRequest) -> Result<Submission> {
    let params = validate(req.kind, &req.params, req.size_hint, &ctx.config)?;

    let (input_ref, staged) = stage(ctx, req.input).await?;
    let job = Job::new(req.kind, params, input_ref, req.size_hint)
        .with_idempotency_key(req.idempotency_key)
        .with_priority(req.priority);

    match record(ctx, job, req.force_async, staged).await? {
        Recorded::Inline(job) => run_inline(ctx, job.id).await,
        Recorded::Queued(job) => Ok(Submission::Accepted { job_id: job.id }),
        Recorded::Existing(job) => {
            tracing::debug!(job_id = %job.id, state = %job.state, "Idempotency key matched");
            settled(ctx, &job).await
        }
    }
}

/// Whether `job` runs inline under the current limits.
pub(crate) fn runs_inline(ctx: &Context, kind: JobKind, size_hint: u64, force_async: bool) -> bool {
    !force_async && size_hint < ctx.config.limits(kind).sync_threshold_bytes
}

/// Outcome of recording a job.
pub(crate) enum Recorded {
    /// Recorded as queued; the caller runs it inline.
    Inline(Job),
    /// Recorded and pushed onto the queue.
    Queued(Job),
    /// The idempotency key matched a live job; nothing was recorded.
    Existing(Job),
}

/// Persist `job` and route it. `staged` says whether the input blob was
/// created for this submission and must be released if no job uses it.
pub(crate) async fn record(
    ctx: &Context,
    job: Job,
    force_async: bool,
    staged: bool,
) -> Result<Recorded> {
    let input_ref = job.input_ref.clone();
    let created = match ctx.store.create_job(job) {
        Ok(created) => created,
        Err(e) => {
            if staged {
                ctx.blobs.remove(&input_ref).await;
            }
            return Err(e);
        }
    };

    let job = match created {
        Created::Existing(job) => {
            if staged {
                ctx.blobs.remove(&input_ref).await;
            }
            return Ok(Recorded::Existing(job));
        }
        Created::New(job) => job,
    };

    if admit(ctx, &job, force_async) {
        Ok(Recorded::Inline(job))
    } else {
        Ok(Recorded::Queued(job))
    }
}

/// Announce a newly recorded job and route it. Returns `true` if the caller
/// runs it inline; otherwise it has been pushed onto the queue.
pub(crate) fn admit(ctx: &Context, job: &Job, force_async: bool) -> bool {
    ctx.emit(EventPayload::JobQueued {
        job_id: job.id,
        kind: job.kind,
    });

    if runs_inline(ctx, job.kind, job.size_hint, force_async) {
        tracing::debug!(job_id = %job.id, kind = %job.kind, size = job.size_hint, "Running inline");
        return true;
    }

    if !ctx.queue.push(job.id, job.priority) {
        tracing::warn!(job_id = %job.id, "Queue is closed; job stays queued for recovery");
    }
    tracing::info!(
        job_id = %job.id,
        kind = %job.kind,
        size = job.size_hint,
        priority = job.priority.as_str(),
        "Job queued"
    );
    false
}

/// Put caller bytes in the blob store. Returns the reference and whether
/// it was created here.
pub(crate) async fn stage(ctx: &Context, input: Input) -> Result<(BlobRef, bool)> {
    match input {
        Input::Bytes(bytes) => Ok((ctx.blobs.put(bytes).await?, true)),
        Input::Blob(blob) => Ok((blob, false)),
    }
}

/// Execute a recorded job inline, retrying retryable failures immediately
/// until attempts run out.
///
/// The attempts run on a task of their own, outside the worker pool, so a
/// caller that stops waiting does not leave the job `running` with nobody
/// behind it.
pub(crate) async fn run_inline(ctx: &Context, id: JobId) -> Result<Submission> {
    tokio::spawn(attempt_inline(ctx.clone(), id))
        .await
        .map_err(|e| Error::Internal(format!("inline attempt for job {id} ended abnormally: {e}")))?
}

async fn attempt_inline(ctx: Context, id: JobId) -> Result<Submission> {
    let ctx = &ctx;
    loop {
        match claim_and_execute(ctx, id, INLINE_WORKER).await? {
            Some(Attempt::Succeeded { job, output }) => {
                return Ok(Submission::Completed {
                    job_id: job.id,
                    output,
                })
            }
            Some(Attempt::Retry { .. }) => continue,
            Some(Attempt::Failed(job)) | Some(Attempt::Canceled(job)) => {
                return settled(ctx, &job).await
            }
            Some(Attempt::Superseded) | None => {
                let job = ctx
                    .store
                    .get_job(id)?
                    .ok_or_else(|| Error::not_found("job", id))?;
                return settled(ctx, &job).await;
            }
        }
    }
}

/// The submission answer for a job in its current state.
async fn settled(ctx: &Context, job: &Job) -> Result<Submission> {
    match job.state {
        JobState::Queued | JobState::Running => Ok(Submission::Accepted { job_id: job.id }),
        JobState::Succeeded => {
            let result = job.result_ref.as_ref().ok_or_else(|| {
                Error::Internal(format!("job {} succeeded without a result", job.id))
            })?;
            Ok(Submission::Completed {
                job_id: job.id,
                output: ctx.blobs.read(result).await?,
            })
        }
        JobState::Failed => Err(Error::Conversion {
            job_id: job.id,
            error: job.error.clone().unwrap_or_else(|| {
                JobError::new(ErrorKind::NonRetryableEngine, "failed without a recorded error")
            }),
        }),
        JobState::Canceled => Err(Error::Conflict(format!("job {} was canceled", job.id))),
    }
}
