//! Shared orchestrator context.
//!
//! [`Context`] bundles every collaborator the submission path, the workers
//! and the status reads need. It is cheap to clone: all fields are `Arc`s.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use mf_av::Engine;
use mf_core::config::{Config, StorageBackend};
use mf_core::events::{EventBus, EventPayload};
use mf_core::{JobId, Result};
use mf_db::{JobStore, MemoryJobStore, SqliteJobStore};

use crate::blobs::BlobStore;
use crate::queue::JobQueue;

#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<JobQueue>,
    pub blobs: Arc<BlobStore>,
    pub engine: Arc<dyn Engine>,
    pub events: Arc<EventBus>,
    /// Cancellation tokens of attempts currently executing, by job.
    pub running: Arc<DashMap<JobId, CancellationToken>>,
}

impl Context {
    pub fn new(
        config: Config,
        store: Arc<dyn JobStore>,
        blobs: BlobStore,
        engine: Arc<dyn Engine>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            queue: Arc::new(JobQueue::new()),
            blobs: Arc::new(blobs),
            engine,
            events: Arc::new(EventBus::default()),
            running: Arc::new(DashMap::new()),
        }
    }

    /// Build the store and blob store named by `config.storage`.
    pub fn from_config(config: Config, engine: Arc<dyn Engine>) -> Result<Self> {
        let store: Arc<dyn JobStore> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryJobStore::new()),
            StorageBackend::Sqlite => {
                let path = config.storage.db_path.clone();
                tracing::info!(path = %path.display(), "Opening job database");
                Arc::new(SqliteJobStore::open(&path)?)
            }
        };
        let blobs = BlobStore::from_config(&config.storage)?;
        Ok(Self::new(config, store, blobs, engine))
    }

    pub(crate) fn emit(&self, payload: EventPayload) {
        self.events.broadcast(payload);
    }
}

/// Owns a claimed job's entry in [`Context::running`] and removes it on
/// drop. The entry itself is inserted inside the claim transition.
pub(crate) struct RunningGuard<'a> {
    running: &'a DashMap<JobId, CancellationToken>,
    id: JobId,
}

impl<'a> RunningGuard<'a> {
    pub(crate) fn new(ctx: &'a Context, id: JobId) -> Self {
        Self {
            running: &ctx.running,
            id,
        }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mf_av::MediaEngine;

    #[test]
    fn running_guard_unregisters_on_drop() {
        let engine: Arc<dyn Engine> = Arc::new(MediaEngine::new(Default::default()));
        let ctx = Context::new(
            Config::default(),
            Arc::new(MemoryJobStore::new()),
            BlobStore::in_memory(),
            engine,
        );
        let id = JobId::new();
        ctx.running.insert(id, CancellationToken::new());
        {
            let _guard = RunningGuard::new(&ctx, id);
            assert!(ctx.running.contains_key(&id));
        }
        assert!(!ctx.running.contains_key(&id));
    }

    #[test]
    fn sqlite_backend_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Sqlite;
        config.storage.db_path = dir.path().join("jobs.db");

        let engine: Arc<dyn Engine> = Arc::new(MediaEngine::new(Default::default()));
        let ctx = Context::from_config(config, engine).unwrap();
        assert!(dir.path().join("jobs.db").exists());
        assert!(ctx.running.is_empty());
    }
}
