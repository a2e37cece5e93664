//! Error taxonomy for mediaforge.
//!
//! Two layers live here. [`JobError`] is the classified failure that gets
//! written into a job record and reported by status queries; its
//! [`ErrorKind`] decides whether the worker pool retries. [`Error`] is the
//! crate-level error returned by library calls.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ids::JobId;

/// Longest message stored on a job record. Engine output beyond this is cut.
pub const MAX_MESSAGE_LEN: usize = 512;

/// Classification of a job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or out-of-range request. Never retried.
    Validation,
    /// Transient engine failure (resource exhaustion, temporary I/O).
    RetryableEngine,
    /// The engine rejected the input deterministically.
    NonRetryableEngine,
    /// The job exceeded its wall-clock deadline.
    Timeout,
    /// Status or result queried for an unknown id.
    NotFound,
}

impl ErrorKind {
    /// Whether a job failing with this kind may be attempted again.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::RetryableEngine)
    }

    /// Wire name, as stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::RetryableEngine => "retryable_engine",
            ErrorKind::NonRetryableEngine => "non_retryable_engine",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotFound => "not_found",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "validation" => Ok(ErrorKind::Validation),
            "retryable_engine" => Ok(ErrorKind::RetryableEngine),
            "non_retryable_engine" => Ok(ErrorKind::NonRetryableEngine),
            "timeout" => Ok(ErrorKind::Timeout),
            "not_found" => Ok(ErrorKind::NotFound),
            other => Err(Error::Internal(format!("unknown error kind: {other}"))),
        }
    }
}

/// A classified failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    /// Build a job error, trimming the message and capping its length.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut message = message.trim().to_string();
        if message.len() > MAX_MESSAGE_LEN {
            let mut cut = MAX_MESSAGE_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
            message.push_str("...");
        }
        Self { kind, message }
    }

    pub fn timeout(limit: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("exceeded deadline of {}s", limit.as_secs()),
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Crate-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request data failed admission checks.
    #[error("Validation error [{field}]: {message}")]
    Validation {
        /// The offending field (`kind`, `format`, `quality`, `size`, ...).
        field: String,
        message: String,
    },

    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A conversion executed inline ended in a classified failure.
    #[error("Job {job_id} failed: {error}")]
    Conversion { job_id: JobId, error: JobError },

    /// The operation conflicts with the current state of a record.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A store operation failed.
    #[error("Database error: {source}")]
    Database {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convenience constructor for [`Error::Validation`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Database`].
    pub fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Database {
            source: source.into(),
        }
    }

    /// The job-failure classification this error corresponds to, if any.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Validation { .. } => Some(ErrorKind::Validation),
            Error::NotFound { .. } => Some(ErrorKind::NotFound),
            Error::Conversion { error, .. } => Some(error.kind),
            _ => None,
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
