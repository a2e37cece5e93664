//! Exactly-once execution under contention, for both store backends.

mod common;

use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;

use common::{test_config, Script, ScriptedEngine, TestHarness};
use mediaforge::SubmitRequest;
use mf_core::{BlobRef, BlobId, Job, JobKind, JobState, Params, Priority};
use mf_db::{JobStore, MemoryJobStore, SqliteJobStore};

fn job() -> Job {
    Job::new(
        JobKind::ImageConvert,
        Params::default(),
        BlobRef::Memory(BlobId::new()),
        16,
    )
}

/// Many threads race to claim one queued job; exactly one wins.
fn race_claims(store: Arc<dyn JobStore>) {
    let job = store.create_job(job()).unwrap().into_job();

    let handles: Vec<_> = (0..16)
        .map(|n| {
            let store = store.clone();
            std::thread::spawn(move || store.claim(job.id, &format!("w{n}")).unwrap().is_some())
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();

    assert_eq!(winners, 1);
    let job = store.get_job(job.id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Running);
    assert_eq!(job.attempt_count, 1);
}

#[test]
fn memory_store_claim_has_one_winner() {
    race_claims(Arc::new(MemoryJobStore::new()));
}

#[test]
fn sqlite_store_claim_has_one_winner() {
    let dir = TempDir::new().unwrap();
    let store = SqliteJobStore::open(&dir.path().join("jobs.db")).unwrap();
    race_claims(Arc::new(store));
}

/// A job id pushed onto the queue many times still runs once.
async fn duplicate_queue_entries_run_once(store: Arc<dyn JobStore>) {
    let mut config = test_config();
    config.queue.workers = 4;
    let engine = ScriptedEngine::new(Script::Succeed);
    let h = TestHarness::with_store(config, store, engine.clone());

    let req = SubmitRequest::new(JobKind::ImageConvert, Bytes::from_static(b"once"))
        .param("format", "png")
        .force_async(true);
    let id = h.orchestrator.submit(req).await.unwrap().job_id();
    for _ in 0..10 {
        h.ctx().queue.push(id, Priority::High);
    }

    let status = h.wait_terminal(id).await;
    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.attempt_count, 1);

    // Let the workers drain the stale entries before counting calls.
    tokio::time::timeout(common::SETTLE_TIMEOUT, async {
        while !h.ctx().queue.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    h.shutdown().await;
    assert_eq!(engine.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_backend_runs_duplicates_once() {
    duplicate_queue_entries_run_once(Arc::new(MemoryJobStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_backend_runs_duplicates_once() {
    let dir = TempDir::new().unwrap();
    let store = SqliteJobStore::open(&dir.path().join("jobs.db")).unwrap();
    duplicate_queue_entries_run_once(Arc::new(store)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_queued_jobs_each_run_once() {
    let mut config = test_config();
    config.queue.workers = 8;
    let engine = ScriptedEngine::new(Script::Succeed);
    let h = TestHarness::with_config(config, engine.clone());

    let mut ids = Vec::new();
    for n in 0..50u8 {
        let req = SubmitRequest::new(JobKind::ImageConvert, Bytes::from(vec![b'a' + n % 26]))
            .param("format", "png")
            .force_async(true);
        ids.push(h.orchestrator.submit(req).await.unwrap().job_id());
    }

    for id in &ids {
        let status = h.wait_terminal(*id).await;
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(status.attempt_count, 1);
    }
    assert_eq!(engine.calls(), ids.len());

    h.shutdown().await;
}
