//! The conversion engine seam.
//!
//! The orchestrator treats an engine as a black box: bytes in, bytes out,
//! or a classified [`EngineError`]. Classification into the job error
//! taxonomy happens here, once, so workers only ever persist [`JobError`]s.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mf_core::{ErrorKind, JobError, JobKind, Params};

use crate::command::ToolError;

/// Progress sink handed to engines; receives fractions in `0.0..=1.0`.
pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

/// A progress sink that discards updates.
pub fn no_progress() -> ProgressFn {
    Arc::new(|_| {})
}

/// Failure reported by an engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Transient; another attempt may succeed.
    #[error("{0}")]
    Retryable(String),
    /// The input was rejected deterministically.
    #[error("{0}")]
    Fatal(String),
    /// The engine cannot serve this kind at all (missing tool).
    #[error("{0}")]
    Unavailable(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Retryable(_) => ErrorKind::RetryableEngine,
            EngineError::Fatal(_) | EngineError::Unavailable(_) => ErrorKind::NonRetryableEngine,
        }
    }

    /// The job error recorded for this failure.
    pub fn to_job_error(&self) -> JobError {
        let message = match self {
            EngineError::Retryable(m) | EngineError::Fatal(m) => m.clone(),
            EngineError::Unavailable(m) => format!("engine unavailable: {m}"),
        };
        JobError::new(self.kind(), message)
    }
}

/// Stderr fragments that indicate a transient host condition rather than a
/// bad input.
const TRANSIENT_MARKERS: &[&str] = &[
    "cannot allocate memory",
    "resource temporarily unavailable",
    "no space left on device",
    "too many open files",
    "connection reset",
];

impl From<ToolError> for EngineError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::Spawn { tool, source } => {
                if source.kind() == std::io::ErrorKind::NotFound {
                    EngineError::Unavailable(format!("{tool}: {source}"))
                } else {
                    EngineError::Retryable(format!("{tool}: failed to spawn: {source}"))
                }
            }
            ToolError::Io { tool, source } => EngineError::Retryable(format!("{tool}: {source}")),
            ToolError::Timeout { tool, timeout } => {
                EngineError::Fatal(format!("{tool}: timed out after {}s", timeout.as_secs()))
            }
            ToolError::Failed { tool, status, stderr } => {
                let lower = stderr.to_ascii_lowercase();
                let reason = condense_stderr(&stderr)
                    .unwrap_or_else(|| format!("exited with {status}"));
                if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
                    EngineError::Retryable(format!("{tool}: {reason}"))
                } else {
                    EngineError::Fatal(format!("{tool}: {reason}"))
                }
            }
        }
    }
}

/// Last meaningful line of tool stderr. Progress key/value lines
/// (`out_time_us=...`) are skipped.
pub fn condense_stderr(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty() && !is_progress_line(line))
        .map(str::to_string)
}

fn is_progress_line(line: &str) -> bool {
    match line.split_once('=') {
        Some((key, _)) => !key.is_empty() && key.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
        None => false,
    }
}

/// An external conversion engine.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn convert(
        &self,
        input: Bytes,
        kind: JobKind,
        params: &Params,
        progress: &ProgressFn,
    ) -> Result<Bytes, EngineError>;

    /// Whether dropping an in-flight `convert` future stops the work. When
    /// `false`, a cancel request against a running job lets the call finish.
    fn interruptible(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(
            EngineError::Retryable("x".into()).kind(),
            ErrorKind::RetryableEngine
        );
        assert_eq!(EngineError::Fatal("x".into()).kind(), ErrorKind::NonRetryableEngine);
        let err = EngineError::Unavailable("ffmpeg not found".into()).to_job_error();
        assert_eq!(err.kind, ErrorKind::NonRetryableEngine);
        assert!(err.message.contains("unavailable"));
    }

    #[test]
    fn condense_picks_last_error_line() {
        let stderr = "Input #0, mov\n  Stream #0:0: Video\ninput: Invalid data found when processing input\nprogress=end\n";
        assert_eq!(
            condense_stderr(stderr).as_deref(),
            Some("input: Invalid data found when processing input")
        );
        assert_eq!(condense_stderr("  \n"), None);
    }

    #[test]
    fn spawn_not_found_is_unavailable() {
        let err = EngineError::from(ToolError::Spawn {
            tool: "ffmpeg".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        });
        assert!(matches!(err, EngineError::Unavailable(_)));
    }

    #[test]
    fn memory_pressure_is_retryable() {
        let status = std::process::Command::new("false").status();
        let Ok(status) = status else { return };
        let err = EngineError::from(ToolError::Failed {
            tool: "ffmpeg".into(),
            status,
            stderr: "Error while filtering: Cannot allocate memory".into(),
        });
        assert!(matches!(err, EngineError::Retryable(_)));
    }

    #[test]
    fn bad_input_is_fatal() {
        let Ok(status) = std::process::Command::new("false").status() else {
            return;
        };
        let err = EngineError::from(ToolError::Failed {
            tool: "ffmpeg".into(),
            status,
            stderr: "clip.bin: Invalid data found when processing input".into(),
        });
        assert_eq!(
            err,
            EngineError::Fatal("ffmpeg: clip.bin: Invalid data found when processing input".into())
        );
    }
}
