//! The job record and its state machine.
//!
//! ```text
//! queued ──claim──▶ running ──▶ succeeded
//!   │  ▲               │  ├────▶ failed
//!   │  └───retry───────┘  └────▶ canceled
//!   └──────cancel────────────────▶ canceled
//! ```
//!
//! The transition methods on [`Job`] only mutate the record. Exclusivity is
//! the store's job: every method here is applied inside a compare-and-set
//! that first checks the current state.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, JobError, Result};
use crate::ids::{BatchId, BlobId, JobId};
use crate::params::Params;

// ---------------------------------------------------------------------------
// JobKind
// ---------------------------------------------------------------------------

/// What a job converts. Closed set; every match over it is exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    ImageConvert,
    AudioConvert,
    VideoConvert,
    AudioExtract,
    Thumbnail,
    Analyze,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::ImageConvert,
        JobKind::AudioConvert,
        JobKind::VideoConvert,
        JobKind::AudioExtract,
        JobKind::Thumbnail,
        JobKind::Analyze,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::ImageConvert => "image-convert",
            JobKind::AudioConvert => "audio-convert",
            JobKind::VideoConvert => "video-convert",
            JobKind::AudioExtract => "audio-extract",
            JobKind::Thumbnail => "thumbnail",
            JobKind::Analyze => "analyze",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| Error::validation("kind", format!("unknown job kind '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobState {
    /// Terminal states are never left once entered.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Canceled
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Canceled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
                | (Running, Queued)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "canceled" => Ok(JobState::Canceled),
            other => Err(Error::Internal(format!("unknown job state: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Queue priority class. The queue is FIFO within a class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Classes in service order.
    pub const ORDER: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Position in [`Priority::ORDER`].
    pub fn rank(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(Error::validation(
                "priority",
                format!("unknown priority '{other}'"),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// BlobRef
// ---------------------------------------------------------------------------

/// Handle to bytes owned by someone else (the blob store or the filesystem).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "store", content = "key", rename_all = "snake_case")]
pub enum BlobRef {
    Memory(BlobId),
    File(PathBuf),
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobRef::Memory(id) => write!(f, "memory:{id}"),
            BlobRef::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}

impl FromStr for BlobRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(id) = s.strip_prefix("memory:") {
            let id = id
                .parse()
                .map_err(|e| Error::Internal(format!("bad blob id '{id}': {e}")))?;
            Ok(BlobRef::Memory(id))
        } else if let Some(path) = s.strip_prefix("file:") {
            Ok(BlobRef::File(PathBuf::from(path)))
        } else {
            Err(Error::Internal(format!("bad blob reference '{s}'")))
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One conversion request's unit of tracked work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub params: Params,
    pub input_ref: BlobRef,
    /// Declared input size in bytes.
    pub size_hint: u64,
    pub priority: Priority,
    pub state: JobState,
    pub attempt_count: u32,
    /// Fraction complete of the current attempt, `0.0..=1.0`.
    pub progress: f32,
    /// Name of the worker holding the claim while running.
    pub worker: Option<String>,
    pub result_ref: Option<BlobRef>,
    pub error: Option<JobError>,
    pub parent_id: Option<BatchId>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(kind: JobKind, params: Params, input_ref: BlobRef, size_hint: u64) -> Self {
        Self {
            id: JobId::new(),
            kind,
            params,
            input_ref,
            size_hint,
            priority: Priority::Normal,
            state: JobState::Queued,
            attempt_count: 0,
            progress: 0.0,
            worker: None,
            result_ref: None,
            error: None,
            parent_id: None,
            idempotency_key: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_parent(mut self, parent: BatchId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether this job answers an idempotency lookup for its key.
    ///
    /// Failed and canceled jobs do not: resubmitting after either creates a
    /// fresh job.
    pub fn satisfies_idempotency(&self) -> bool {
        matches!(
            self.state,
            JobState::Queued | JobState::Running | JobState::Succeeded
        )
    }

    fn enter(&mut self, next: JobState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
    }

    /// `queued -> running`: start a new attempt on behalf of `worker`.
    pub fn claim(&mut self, worker: &str) {
        self.enter(JobState::Running);
        self.attempt_count += 1;
        self.progress = 0.0;
        self.worker = Some(worker.to_string());
        self.started_at = Some(Utc::now());
    }

    /// `running -> succeeded`.
    pub fn succeed(&mut self, result_ref: BlobRef) {
        self.enter(JobState::Succeeded);
        self.progress = 1.0;
        self.result_ref = Some(result_ref);
        self.finished_at = Some(Utc::now());
    }

    /// `running -> failed`.
    pub fn fail(&mut self, error: JobError) {
        self.enter(JobState::Failed);
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }

    /// `running -> queued` for another attempt. The attempt count is kept.
    pub fn requeue(&mut self) {
        self.enter(JobState::Queued);
        self.progress = 0.0;
        self.worker = None;
        self.started_at = None;
    }

    /// `queued -> canceled` or `running -> canceled`.
    pub fn cancel(&mut self) {
        self.enter(JobState::Canceled);
        self.worker = None;
        self.finished_at = Some(Utc::now());
    }

    pub fn set_progress(&mut self, progress: f32) {
        self.progress = progress.clamp(0.0, 1.0);
    }
}
