//! Mediaforge - media conversion job orchestration
//!
//! Requests are validated, persisted as jobs, and either run inline or
//! queued for a worker pool that retries, times out, and cancels attempts.
//! The library crate exposes the orchestrator for embedding and for
//! integration testing.

pub mod batch;
pub mod blobs;
pub mod config;
pub mod context;
pub mod orchestrator;
pub mod queue;
pub mod status;
pub mod submission;
pub mod validation;
pub mod worker;

pub use batch::{BatchHandle, BatchInput, BatchRequest};
pub use blobs::BlobStore;
pub use context::Context;
pub use orchestrator::Orchestrator;
pub use queue::JobQueue;
pub use status::{BatchStatus, CancelOutcome, JobStatus, ResultView, StatusView};
pub use submission::{Input, SubmitRequest, Submission};
pub use worker::{Attempt, WorkerPool};
