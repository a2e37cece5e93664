//! Conversion parameters.
//!
//! Callers hand in a loose [`RawParams`] map (decoded JSON, or `key=value`
//! pairs from the CLI). Admission turns that into a typed [`Params`], which is
//! what gets persisted on the job and handed to the engine. `Params` is never
//! mutated after admission.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Unvalidated parameters as supplied by the caller.
pub type RawParams = BTreeMap<String, serde_json::Value>;

/// Every parameter name the gate understands, across all kinds.
pub const KNOWN_KEYS: &[&str] = &[
    "format",
    "quality",
    "width",
    "height",
    "bitrate",
    "sample_rate",
    "channels",
    "frame_rate",
    "timestamp",
    "codec",
];

/// Format used for thumbnails when the request names none.
pub const DEFAULT_THUMBNAIL_FORMAT: &str = "jpg";

/// Normalized, validated conversion options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Params {
    /// Target container / file format, lower-cased.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Encoder quality, 1-100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Target bitrate in kbps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    /// Audio sample rate in Hz.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<f64>,
    /// Seek position in seconds (thumbnails).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    /// Video codec family (`h264`, `h265`, `vp8`, `vp9`, `av1`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
}

impl Params {
    /// Target format, if one was requested.
    pub fn format(&self) -> Option<&str> {
        self.format.as_deref()
    }

    /// Serialize to a JSON string for storage.
    pub fn to_json(&self) -> String {
        // Params only holds plain scalars; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse from the stored JSON representation.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
