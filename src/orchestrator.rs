//! The orchestrator facade.
//!
//! [`Orchestrator`] owns the shared [`Context`] and the [`WorkerPool`] and
//! exposes the core operations. Starting it runs startup recovery before
//! the workers begin draining the queue.

use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use mf_av::Engine;
use mf_core::config::Config;
use mf_core::events::Event;
use mf_core::{BatchId, JobId, Result};

use crate::batch::{submit_batch, BatchHandle, BatchRequest};
use crate::context::Context;
use crate::status::{self, BatchStatus, CancelOutcome, JobStatus, ResultView, StatusView};
use crate::submission::{submit, SubmitRequest, Submission};
use crate::worker::{recover, WorkerPool};

pub struct Orchestrator {
    ctx: Context,
    pool: WorkerPool,
}

impl Orchestrator {
    /// Recover persisted work and start the worker pool. Must be called
    /// from within a tokio runtime.
    pub fn start(ctx: Context) -> Result<Self> {
        ctx.config.check()?;
        let requeued = recover(&ctx)?;
        let pool = WorkerPool::start(&ctx);
        tracing::info!(requeued, "Orchestrator ready");
        Ok(Self { ctx, pool })
    }

    /// Build the context named by `config` and start.
    pub fn from_config(config: Config, engine: Arc<dyn Engine>) -> Result<Self> {
        Self::start(Context::from_config(config, engine)?)
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub async fn submit(&self, req: SubmitRequest) -> Result<Submission> {
        submit(&self.ctx, req).await
    }

    pub async fn submit_batch(&self, req: BatchRequest) -> Result<BatchHandle> {
        submit_batch(&self.ctx, req).await
    }

    pub fn get_status(&self, id: Uuid) -> Result<StatusView> {
        status::get_status(&self.ctx, id)
    }

    pub fn job_status(&self, id: JobId) -> Result<JobStatus> {
        status::job_status(&self.ctx, id)
    }

    pub fn batch_status(&self, id: BatchId) -> Result<BatchStatus> {
        status::batch_status(&self.ctx, id)
    }

    pub async fn get_result(&self, id: JobId) -> Result<ResultView> {
        status::get_result(&self.ctx, id).await
    }

    pub fn cancel(&self, id: JobId) -> Result<CancelOutcome> {
        status::cancel(&self.ctx, id)
    }

    /// Job lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.ctx.events.subscribe()
    }

    /// Stop the workers after their current attempts.
    pub async fn shutdown(self) {
        self.pool.shutdown(&self.ctx).await;
    }
}
