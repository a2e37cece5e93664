//! Configuration types.
//!
//! The top-level [`Config`] is deserialized from TOML by the binary. Every
//! section defaults sensibly so an empty file is valid. Per-kind limits are
//! sparse overrides on top of built-in defaults; read them through
//! [`Config::limits`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::job::JobKind;

const MIB: u64 = 1024 * 1024;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queue: QueueConfig,
    pub limits: LimitsConfig,
    pub storage: StorageConfig,
    pub tools: ToolsConfig,
}

impl Config {
    /// Effective limits for `kind`: built-in defaults with any configured
    /// overrides applied.
    pub fn limits(&self, kind: JobKind) -> KindLimits {
        let base = KindLimits::defaults_for(kind);
        match self.limits.get(kind) {
            Some(o) => KindLimits {
                sync_threshold_bytes: o.sync_threshold_bytes.unwrap_or(base.sync_threshold_bytes),
                max_input_bytes: o.max_input_bytes.unwrap_or(base.max_input_bytes),
                timeout_secs: o.timeout_secs.unwrap_or(base.timeout_secs),
            },
            None => base,
        }
    }

    /// Reject configurations the orchestrator cannot run with.
    pub fn check(&self) -> Result<()> {
        if self.queue.workers == 0 {
            return Err(Error::validation("queue.workers", "must be at least 1"));
        }
        if self.queue.max_attempts == 0 {
            return Err(Error::validation("queue.max_attempts", "must be at least 1"));
        }
        for kind in JobKind::ALL {
            if self.limits(kind).timeout_secs == 0 {
                return Err(Error::validation(
                    format!("limits.{kind}.timeout_secs"),
                    "must be at least 1",
                ));
            }
        }
        Ok(())
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.queue.workers > 64 {
            warnings.push(format!(
                "queue.workers is {}; engine processes may oversubscribe the host",
                self.queue.workers
            ));
        }

        if self.queue.retention_secs > 0
            && self.queue.janitor_interval_secs > self.queue.retention_secs
        {
            warnings.push(
                "queue.janitor_interval_secs exceeds retention_secs; jobs will outlive the window"
                    .into(),
            );
        }

        for kind in JobKind::ALL {
            let limits = self.limits(kind);
            if limits.sync_threshold_bytes > limits.max_input_bytes {
                warnings.push(format!(
                    "limits.{kind}.sync_threshold_bytes exceeds max_input_bytes; every admitted {kind} job runs inline"
                ));
            }
        }

        if self.storage.backend == StorageBackend::Sqlite
            && self.storage.db_path.as_os_str().is_empty()
        {
            warnings.push("storage.backend is sqlite but db_path is empty".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Worker pool and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,
    /// Total attempts per job, including the first.
    pub max_attempts: u32,
    /// Delay before a retryable failure is re-enqueued.
    pub retry_backoff_ms: u64,
    /// How long terminal jobs stay queryable. Zero disables purging.
    pub retention_secs: u64,
    pub janitor_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            retry_backoff_ms: 60_000,
            retention_secs: 3600,
            janitor_interval_secs: 60,
        }
    }
}

impl QueueConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Sparse per-kind overrides, keyed by the kind's wire name
/// (`[limits.image-convert]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LimitsConfig {
    pub image_convert: Option<KindOverrides>,
    pub audio_convert: Option<KindOverrides>,
    pub video_convert: Option<KindOverrides>,
    pub audio_extract: Option<KindOverrides>,
    pub thumbnail: Option<KindOverrides>,
    pub analyze: Option<KindOverrides>,
}

impl LimitsConfig {
    pub fn get(&self, kind: JobKind) -> Option<&KindOverrides> {
        match kind {
            JobKind::ImageConvert => self.image_convert.as_ref(),
            JobKind::AudioConvert => self.audio_convert.as_ref(),
            JobKind::VideoConvert => self.video_convert.as_ref(),
            JobKind::AudioExtract => self.audio_extract.as_ref(),
            JobKind::Thumbnail => self.thumbnail.as_ref(),
            JobKind::Analyze => self.analyze.as_ref(),
        }
    }

    pub fn get_mut(&mut self, kind: JobKind) -> &mut KindOverrides {
        let slot = match kind {
            JobKind::ImageConvert => &mut self.image_convert,
            JobKind::AudioConvert => &mut self.audio_convert,
            JobKind::VideoConvert => &mut self.video_convert,
            JobKind::AudioExtract => &mut self.audio_extract,
            JobKind::Thumbnail => &mut self.thumbnail,
            JobKind::Analyze => &mut self.analyze,
        };
        slot.get_or_insert_with(KindOverrides::default)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KindOverrides {
    pub sync_threshold_bytes: Option<u64>,
    pub max_input_bytes: Option<u64>,
    pub timeout_secs: Option<u64>,
}

/// Resolved limits for one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindLimits {
    /// Inputs strictly smaller than this run inline.
    pub sync_threshold_bytes: u64,
    /// Admission ceiling on the declared input size.
    pub max_input_bytes: u64,
    /// Hard deadline for one engine call.
    pub timeout_secs: u64,
}

impl KindLimits {
    pub fn defaults_for(kind: JobKind) -> Self {
        let (sync_threshold_bytes, max_input_bytes) = match kind {
            JobKind::ImageConvert => (5 * MIB, 50_485_760),
            JobKind::AudioConvert => (MIB, 200 * MIB),
            JobKind::VideoConvert
            | JobKind::AudioExtract
            | JobKind::Thumbnail
            | JobKind::Analyze => (0, 500 * MIB),
        };
        Self {
            sync_threshold_bytes,
            max_input_bytes,
            timeout_secs: 600,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

/// Where job records and blob bytes live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub db_path: PathBuf,
    /// When set, blobs are written here instead of held in memory.
    pub spill_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            db_path: PathBuf::from("./data/mediaforge.db"),
            spill_dir: None,
        }
    }
}

/// Paths to external CLI tools. Unset paths are looked up on `PATH`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}
