//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which builds an [`Orchestrator`] over an
//! in-memory store and blob store, and [`ScriptedEngine`], a fake engine
//! whose behavior each test picks up front.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use mediaforge::{BlobStore, Context, JobStatus, Orchestrator};
use mf_av::{Engine, EngineError, ProgressFn};
use mf_core::config::Config;
use mf_core::{JobId, JobKind, Params};
use mf_db::{JobStore, MemoryJobStore};

/// How long a test waits for a job to settle before giving up.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// What a [`ScriptedEngine`] does on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Return the input upper-cased, reporting progress half way.
    Succeed,
    /// Always fail with a transient error.
    Retryable,
    /// Always fail with a permanent error.
    Fatal,
    /// Fail transiently for the first `n` calls, then succeed.
    FlakyFor(usize),
    /// Block until [`ScriptedEngine::release`], then succeed.
    Block,
}

pub struct ScriptedEngine {
    script: Script,
    interruptible: bool,
    calls: AtomicUsize,
    started: Notify,
    release: Notify,
}

impl ScriptedEngine {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            interruptible: false,
            calls: AtomicUsize::new(0),
            started: Notify::new(),
            release: Notify::new(),
        })
    }

    /// Like [`ScriptedEngine::new`], but dropping a call stops it.
    pub fn interruptible(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            interruptible: true,
            calls: AtomicUsize::new(0),
            started: Notify::new(),
            release: Notify::new(),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Resolve once a call has started (stored permit if it already has).
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    /// Let one blocked call finish.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn convert(
        &self,
        input: Bytes,
        _kind: JobKind,
        _params: &Params,
        progress: &ProgressFn,
    ) -> Result<Bytes, EngineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.started.notify_one();
        match self.script {
            Script::Succeed => {
                progress(0.5);
                Ok(Bytes::from(input.to_ascii_uppercase()))
            }
            Script::Retryable => Err(EngineError::Retryable(format!(
                "resource temporarily unavailable (call {call})"
            ))),
            Script::Fatal => Err(EngineError::Fatal("invalid data found".into())),
            Script::FlakyFor(n) if call <= n => {
                Err(EngineError::Retryable(format!("flaky call {call}")))
            }
            Script::FlakyFor(_) => Ok(input),
            Script::Block => {
                self.release.notified().await;
                Ok(input)
            }
        }
    }

    fn interruptible(&self) -> bool {
        self.interruptible
    }
}

/// Defaults tuned for tests: two workers, no retry backoff.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.queue.workers = 2;
    config.queue.retry_backoff_ms = 0;
    config
}

/// Test harness wrapping a started [`Orchestrator`].
pub struct TestHarness {
    pub orchestrator: Orchestrator,
}

impl TestHarness {
    /// Default test configuration and an in-memory store.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self::with_config(test_config(), engine)
    }

    /// Custom configuration and an in-memory store.
    pub fn with_config(config: Config, engine: Arc<dyn Engine>) -> Self {
        Self::with_store(config, Arc::new(MemoryJobStore::new()), engine)
    }

    /// Custom configuration and store, e.g. a SQLite file.
    pub fn with_store(config: Config, store: Arc<dyn JobStore>, engine: Arc<dyn Engine>) -> Self {
        let ctx = Context::new(config, store, BlobStore::in_memory(), engine);
        let orchestrator = Orchestrator::start(ctx).expect("failed to start orchestrator");
        Self { orchestrator }
    }

    pub fn ctx(&self) -> &Context {
        self.orchestrator.context()
    }

    /// Poll until `id` reaches a terminal state.
    pub async fn wait_terminal(&self, id: JobId) -> JobStatus {
        self.wait_for(id, |status| status.state.is_terminal()).await
    }

    /// Poll until `done` holds for the job's status.
    pub async fn wait_for(&self, id: JobId, done: impl Fn(&JobStatus) -> bool) -> JobStatus {
        tokio::time::timeout(SETTLE_TIMEOUT, async {
            loop {
                let status = self.orchestrator.job_status(id).expect("job status");
                if done(&status) {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not settle in time")
    }

    pub async fn shutdown(self) {
        self.orchestrator.shutdown().await;
    }
}
