//! Worker pool and the execution path shared with inline submissions.
//!
//! A worker pops a job id, claims it through the store's compare-and-set,
//! runs the engine under the kind's deadline, and records the outcome.
//! Retryable failures go back to `queued` and are re-enqueued after the
//! configured backoff. Engine errors never escape this module: they are
//! classified and written to the store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mf_av::{EngineError, ProgressFn};
use mf_core::events::EventPayload;
use mf_core::{Error, ErrorKind, Job, JobError, JobId, JobState, Priority, Result};

use crate::context::{Context, RunningGuard};

/// Worker name recorded on jobs executed on the submitting task.
pub const INLINE_WORKER: &str = "inline";

/// Smallest progress change worth persisting.
const PROGRESS_STEP: f32 = 0.01;

/// What one claimed attempt ended in.
#[derive(Debug)]
pub enum Attempt {
    Succeeded { job: Job, output: Bytes },
    Failed(Job),
    /// Back in `queued`; another attempt is due.
    Retry { job: Job, error: JobError },
    Canceled(Job),
    /// The store refused the final transition; someone else settled the job.
    Superseded,
}

enum Run {
    Finished(std::result::Result<Bytes, EngineError>),
    TimedOut(Duration),
    Canceled,
}

// ---------------------------------------------------------------------------
// Claim + execute
// ---------------------------------------------------------------------------

/// Claim `id` for `worker` and, if the claim wins, run one attempt.
/// `Ok(None)` means the job was not claimable (already claimed, canceled,
/// or gone).
pub(crate) async fn claim_and_execute(
    ctx: &Context,
    id: JobId,
    worker: &str,
) -> Result<Option<Attempt>> {
    let token = CancellationToken::new();
    let running = &ctx.running;

    // The token is registered inside the compare-and-set so a cancel that
    // observes `running` always finds it.
    let claimed = ctx.store.transition(id, &[JobState::Queued], &mut |job| {
        job.claim(worker);
        running.insert(id, token.clone());
    });
    let job = match claimed {
        Ok(Some(job)) => job,
        Ok(None) => return Ok(None),
        Err(e) => {
            running.remove(&id);
            return Err(e);
        }
    };

    let _guard = RunningGuard::new(ctx, id);
    execute(ctx, &job, worker, &token).await.map(Some)
}

async fn execute(
    ctx: &Context,
    job: &Job,
    worker: &str,
    cancel: &CancellationToken,
) -> Result<Attempt> {
    let id = job.id;
    tracing::info!(
        job_id = %id,
        kind = %job.kind,
        attempt = job.attempt_count,
        worker,
        "Starting job"
    );
    ctx.emit(EventPayload::JobStarted {
        job_id: id,
        attempt: job.attempt_count,
        worker: worker.to_string(),
    });

    let input = match ctx.blobs.read(&job.input_ref).await {
        Ok(bytes) => bytes,
        Err(Error::NotFound { .. }) => {
            let error = JobError::new(
                ErrorKind::NonRetryableEngine,
                format!("input {} is no longer available", job.input_ref),
            );
            return settle_failure(ctx, job, error, cancel);
        }
        Err(e) => {
            let error = JobError::new(
                ErrorKind::RetryableEngine,
                format!("failed to read input: {e}"),
            );
            return settle_failure(ctx, job, error, cancel);
        }
    };

    let deadline = ctx.config.limits(job.kind).timeout();
    let progress = progress_sink(ctx, id);
    let started = Instant::now();

    let call = ctx.engine.convert(input, job.kind, &job.params, &progress);
    let run = if ctx.engine.interruptible() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Run::Canceled,
            result = tokio::time::timeout(deadline, call) => match result {
                Ok(result) => Run::Finished(result),
                Err(_) => Run::TimedOut(deadline),
            },
        }
    } else {
        match tokio::time::timeout(deadline, call).await {
            Ok(result) => Run::Finished(result),
            Err(_) => Run::TimedOut(deadline),
        }
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match run {
        Run::Canceled => {
            tracing::info!(job_id = %id, elapsed_ms, "Engine call interrupted by cancel");
            settle_canceled(ctx, id)
        }
        Run::TimedOut(limit) => {
            tracing::warn!(job_id = %id, elapsed_ms, "Job exceeded its deadline");
            settle_failure(ctx, job, JobError::timeout(limit), cancel)
        }
        Run::Finished(Err(e)) => {
            tracing::warn!(job_id = %id, elapsed_ms, error = %e, "Engine call failed");
            settle_failure(ctx, job, e.to_job_error(), cancel)
        }
        Run::Finished(Ok(output)) => {
            let blob = match ctx.blobs.put(output.clone()).await {
                Ok(blob) => blob,
                Err(e) => {
                    let error = JobError::new(
                        ErrorKind::RetryableEngine,
                        format!("failed to store output: {e}"),
                    );
                    return settle_failure(ctx, job, error, cancel);
                }
            };
            match ctx.store.complete(id, blob.clone())? {
                Some(job) => {
                    tracing::info!(
                        job_id = %id,
                        elapsed_ms,
                        output_bytes = output.len(),
                        "Job succeeded"
                    );
                    ctx.emit(EventPayload::JobSucceeded { job_id: id });
                    Ok(Attempt::Succeeded { job, output })
                }
                None => {
                    ctx.blobs.remove(&blob).await;
                    Ok(Attempt::Superseded)
                }
            }
        }
    }
}

fn settle_canceled(ctx: &Context, id: JobId) -> Result<Attempt> {
    match ctx.store.mark_canceled(id)? {
        Some(job) => {
            ctx.emit(EventPayload::JobCanceled { job_id: id });
            Ok(Attempt::Canceled(job))
        }
        None => Ok(Attempt::Superseded),
    }
}

/// Requeue a retryable failure with attempts left; fail it otherwise.
fn settle_failure(
    ctx: &Context,
    job: &Job,
    error: JobError,
    cancel: &CancellationToken,
) -> Result<Attempt> {
    let id = job.id;
    let retry = error.is_retryable() && job.attempt_count < ctx.config.queue.max_attempts;

    // A cancel that arrived while a non-interruptible call ran does not get
    // another attempt.
    if retry && cancel.is_cancelled() {
        return settle_canceled(ctx, id);
    }

    if retry {
        return match ctx.store.requeue(id)? {
            Some(job) => {
                tracing::warn!(
                    job_id = %id,
                    attempt = job.attempt_count,
                    max_attempts = ctx.config.queue.max_attempts,
                    error = %error,
                    "Retryable failure; job requeued"
                );
                ctx.emit(EventPayload::JobRetrying {
                    job_id: id,
                    attempt: job.attempt_count,
                    error: error.clone(),
                });
                Ok(Attempt::Retry { job, error })
            }
            None => Ok(Attempt::Superseded),
        };
    }

    match ctx.store.fail(id, error.clone())? {
        Some(job) => {
            tracing::error!(
                job_id = %id,
                attempt = job.attempt_count,
                error = %error,
                "Job failed"
            );
            ctx.emit(EventPayload::JobFailed { job_id: id, error });
            Ok(Attempt::Failed(job))
        }
        None => Ok(Attempt::Superseded),
    }
}

/// Progress callback that persists and broadcasts changes of at least
/// [`PROGRESS_STEP`].
fn progress_sink(ctx: &Context, id: JobId) -> ProgressFn {
    let store = ctx.store.clone();
    let events = ctx.events.clone();
    let last = Mutex::new(-1.0_f32);

    Arc::new(move |progress: f32| {
        let progress = progress.clamp(0.0, 1.0);
        {
            let mut last = last.lock();
            if progress < 1.0 && (progress - *last).abs() < PROGRESS_STEP {
                return;
            }
            *last = progress;
        }
        match store.set_progress(id, progress) {
            Ok(true) => events.broadcast(EventPayload::JobProgress {
                job_id: id,
                progress,
            }),
            Ok(false) => {}
            Err(e) => tracing::debug!(job_id = %id, error = %e, "Failed to record progress"),
        }
    })
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Fixed-size set of worker tasks draining the shared queue, plus the
/// retention janitor.
pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.queue.workers` workers on the current runtime.
    pub fn start(ctx: &Context) -> Self {
        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();

        for n in 0..ctx.config.queue.workers {
            let name = format!("worker-{n}");
            handles.push(tokio::spawn(run_worker(
                ctx.clone(),
                name,
                shutdown.clone(),
            )));
        }

        let queue = &ctx.config.queue;
        if queue.retention_secs > 0 && queue.janitor_interval_secs > 0 {
            handles.push(tokio::spawn(run_janitor(ctx.clone(), shutdown.clone())));
        }

        tracing::info!(workers = ctx.config.queue.workers, "Worker pool started");
        Self { shutdown, handles }
    }

    /// Token that, once cancelled, stops the workers after their current
    /// attempt.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting work, let in-flight attempts finish, and wait for
    /// every task to exit.
    pub async fn shutdown(self, ctx: &Context) {
        self.shutdown.cancel();
        ctx.queue.close();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Worker task ended abnormally");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

async fn run_worker(ctx: Context, name: String, shutdown: CancellationToken) {
    tracing::debug!(worker = %name, "Worker started");

    loop {
        let id = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = ctx.queue.pop() => match next {
                Some(id) => id,
                None => break,
            },
        };

        match claim_and_execute(&ctx, id, &name).await {
            Ok(Some(Attempt::Retry { job, .. })) => {
                schedule_retry(&ctx, job.id, job.priority, shutdown.clone());
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::debug!(worker = %name, job_id = %id, "Job not claimable; skipped");
            }
            Err(e) => {
                tracing::error!(worker = %name, job_id = %id, error = %e, "Worker error");
            }
        }
    }

    tracing::debug!(worker = %name, "Worker stopped");
}

/// Put `id` back on the queue once the retry backoff has elapsed. A job
/// canceled in the meantime is skipped at claim time.
fn schedule_retry(ctx: &Context, id: JobId, priority: Priority, shutdown: CancellationToken) {
    let backoff = ctx.config.queue.retry_backoff();
    let queue = ctx.queue.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(backoff) => {
                queue.push(id, priority);
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Recovery and retention
// ---------------------------------------------------------------------------

/// Startup recovery: return orphaned `running` jobs to `queued` and enqueue
/// every queued job, oldest first. Returns how many were enqueued.
pub fn recover(ctx: &Context) -> Result<usize> {
    let reset = ctx.store.reset_orphaned()?;
    if !reset.is_empty() {
        tracing::info!(count = reset.len(), "Reset orphaned jobs from a previous run");
    }

    let queued = ctx.store.list_by_state(JobState::Queued)?;
    for job in &queued {
        ctx.queue.push(job.id, job.priority);
    }
    if !queued.is_empty() {
        tracing::info!(count = queued.len(), "Re-enqueued queued jobs");
    }
    Ok(queued.len())
}

/// Remove terminal jobs older than the retention window, with their blobs.
pub async fn purge_expired(ctx: &Context) -> Result<usize> {
    let retention = chrono::Duration::from_std(ctx.config.queue.retention())
        .map_err(|e| Error::Internal(format!("retention out of range: {e}")))?;
    let cutoff = Utc::now() - retention;

    let purged = ctx.store.purge_finished_before(cutoff)?;
    for job in &purged {
        ctx.blobs.remove(&job.input_ref).await;
        if let Some(result) = &job.result_ref {
            ctx.blobs.remove(result).await;
        }
    }
    if !purged.is_empty() {
        tracing::debug!(count = purged.len(), "Purged expired jobs");
    }
    Ok(purged.len())
}

async fn run_janitor(ctx: Context, shutdown: CancellationToken) {
    let period = Duration::from_secs(ctx.config.queue.janitor_interval_secs);
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        if let Err(e) = purge_expired(&ctx).await {
            tracing::warn!(error = %e, "Janitor pass failed");
        }
    }
}
