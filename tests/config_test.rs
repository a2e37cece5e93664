//! Config files driving a running orchestrator.

mod common;

use std::io::Write;

use bytes::Bytes;
use tempfile::{NamedTempFile, TempDir};

use common::{Script, ScriptedEngine};
use mediaforge::config::{load_config, load_config_or_default, StorageBackend};
use mediaforge::{Orchestrator, SubmitRequest, Submission};
use mf_core::JobKind;

fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn sync_threshold_from_file_controls_inline_path() {
    let file = config_file(
        r#"
[queue]
workers = 1
retry_backoff_ms = 0

[limits.image-convert]
sync_threshold_bytes = 4
"#,
    );
    let config = load_config(file.path()).unwrap();
    let orchestrator = Orchestrator::from_config(config, ScriptedEngine::new(Script::Succeed)).unwrap();

    let small = SubmitRequest::new(JobKind::ImageConvert, Bytes::from_static(b"abc"))
        .param("format", "png");
    assert!(matches!(
        orchestrator.submit(small).await.unwrap(),
        Submission::Completed { .. }
    ));

    let large = SubmitRequest::new(JobKind::ImageConvert, Bytes::from_static(b"abcdef"))
        .param("format", "png");
    assert!(matches!(
        orchestrator.submit(large).await.unwrap(),
        Submission::Accepted { .. }
    ));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn sqlite_backend_from_file_creates_database() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("state").join("jobs.db");
    let file = config_file(&format!(
        "[storage]\nbackend = \"sqlite\"\ndb_path = {:?}\n",
        db.to_string_lossy()
    ));

    let config = load_config_or_default(Some(file.path())).unwrap();
    assert_eq!(config.storage.backend, StorageBackend::Sqlite);

    let orchestrator = Orchestrator::from_config(config, ScriptedEngine::new(Script::Succeed)).unwrap();
    assert!(db.exists());
    orchestrator.shutdown().await;
}

#[test]
fn invalid_values_fail_hard() {
    let file = config_file("[queue]\nmax_attempts = 0\n");
    let err = load_config(file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("max_attempts"));
}
