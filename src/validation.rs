//! Admission checks for conversion requests.
//!
//! [`validate`] is pure: it turns a caller's loose [`RawParams`] into typed
//! [`Params`] or a [`Error::Validation`] naming the offending field. Checks
//! run in a fixed order (kind, parameter names, format, numeric ranges,
//! declared size) so the first problem reported is deterministic.

use std::str::FromStr;

use mf_core::config::Config;
use mf_core::params::DEFAULT_THUMBNAIL_FORMAT;
use mf_core::{Error, JobKind, Params, RawParams, Result};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Per-kind rules
// ---------------------------------------------------------------------------

const IMAGE_FORMATS: &[&str] = &[
    "jpeg", "jpg", "png", "webp", "bmp", "gif", "tiff", "tif", "ico",
];
const AUDIO_FORMATS: &[&str] = &[
    "wav", "mp3", "aac", "ogg", "flac", "m4a", "opus", "webm", "aiff", "au",
];
const VIDEO_FORMATS: &[&str] = &[
    "mp4", "mkv", "webm", "avi", "mov", "wmv", "flv", "ogv", "m4v", "3gp",
];
const EXTRACT_FORMATS: &[&str] = &["mp3", "aac", "wav", "ogg", "flac"];
const THUMBNAIL_FORMATS: &[&str] = &["jpg", "jpeg", "png", "webp"];

const VIDEO_CODECS: &[&str] = &["h264", "h265", "vp8", "vp9", "av1"];

/// Sample rates the audio encoders accept.
pub const SAMPLE_RATES: &[u32] = &[
    8000, 11025, 16000, 22050, 32000, 44100, 48000, 88200, 96000, 192000,
];

struct KindRules {
    keys: &'static [&'static str],
    formats: &'static [&'static str],
    format_required: bool,
}

fn rules(kind: JobKind) -> KindRules {
    match kind {
        JobKind::ImageConvert => KindRules {
            keys: &["format", "quality", "width", "height"],
            formats: IMAGE_FORMATS,
            format_required: true,
        },
        JobKind::AudioConvert => KindRules {
            keys: &["format", "bitrate", "sample_rate", "channels"],
            formats: AUDIO_FORMATS,
            format_required: true,
        },
        JobKind::VideoConvert => KindRules {
            keys: &["format", "codec", "bitrate", "width", "height", "frame_rate"],
            formats: VIDEO_FORMATS,
            format_required: true,
        },
        JobKind::AudioExtract => KindRules {
            keys: &["format", "bitrate"],
            formats: EXTRACT_FORMATS,
            format_required: true,
        },
        JobKind::Thumbnail => KindRules {
            keys: &["format", "timestamp", "width", "height"],
            formats: THUMBNAIL_FORMATS,
            format_required: false,
        },
        JobKind::Analyze => KindRules {
            keys: &[],
            formats: &[],
            format_required: false,
        },
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Parse a kind name from the wire. Unknown names fail on `kind`.
pub fn parse_kind(name: &str) -> Result<JobKind> {
    JobKind::from_str(name)
}

/// Validate and normalize a request for `kind`.
pub fn validate(
    kind: JobKind,
    raw: &RawParams,
    size_hint: u64,
    config: &Config,
) -> Result<Params> {
    let rules = rules(kind);

    if let Some(unknown) = raw.keys().find(|k| !rules.keys.contains(&k.as_str())) {
        return Err(Error::validation(
            unknown.as_str(),
            format!("unknown parameter for {kind}"),
        ));
    }

    let mut params = Params {
        format: check_format(kind, &rules, raw)?,
        ..Params::default()
    };
    check_ranges(kind, raw, &mut params)?;
    check_size(kind, size_hint, config)?;

    Ok(params)
}

/// Reject a declared input size above the kind's ceiling.
pub fn check_size(kind: JobKind, size_hint: u64, config: &Config) -> Result<()> {
    let ceiling = config.limits(kind).max_input_bytes;
    if size_hint > ceiling {
        return Err(Error::validation(
            "size",
            format!("{size_hint} bytes exceeds the {kind} limit of {ceiling} bytes"),
        ));
    }
    Ok(())
}

fn check_format(kind: JobKind, rules: &KindRules, raw: &RawParams) -> Result<Option<String>> {
    let Some(value) = present(raw, "format") else {
        if rules.format_required {
            return Err(Error::validation("format", format!("{kind} requires a target format")));
        }
        return Ok((kind == JobKind::Thumbnail).then(|| DEFAULT_THUMBNAIL_FORMAT.to_string()));
    };

    let format = text("format", value)?;
    if !rules.formats.contains(&format.as_str()) {
        return Err(Error::validation(
            "format",
            format!(
                "'{format}' is not a supported {kind} output; expected one of {}",
                rules.formats.join(", ")
            ),
        ));
    }
    Ok(Some(format))
}

fn check_ranges(kind: JobKind, raw: &RawParams, params: &mut Params) -> Result<()> {
    match kind {
        JobKind::ImageConvert => {
            params.quality = int_in(raw, "quality", 1, 100)?.map(|v| v as u8);
            params.width = int_in(raw, "width", 1, 8000)?.map(|v| v as u32);
            params.height = int_in(raw, "height", 1, 8000)?.map(|v| v as u32);
        }
        JobKind::AudioConvert => {
            params.bitrate = int_in(raw, "bitrate", 32, 1411)?.map(|v| v as u32);
            params.channels = int_in(raw, "channels", 1, 8)?.map(|v| v as u8);
            params.sample_rate = int_in(raw, "sample_rate", 8000, 192_000)?.map(|v| v as u32);
            if let Some(rate) = params.sample_rate {
                if !SAMPLE_RATES.contains(&rate) {
                    return Err(Error::validation(
                        "sample_rate",
                        format!("{rate} Hz is not a standard sample rate"),
                    ));
                }
            }
        }
        JobKind::VideoConvert => {
            params.width = int_in(raw, "width", 64, 7680)?.map(|v| v as u32);
            params.height = int_in(raw, "height", 64, 4320)?.map(|v| v as u32);
            params.frame_rate = float_in(raw, "frame_rate", 12.0, 120.0)?;
            params.bitrate = int_in(raw, "bitrate", 64, 100_000)?.map(|v| v as u32);
            if let Some(value) = present(raw, "codec") {
                let codec = text("codec", value)?;
                if !VIDEO_CODECS.contains(&codec.as_str()) {
                    return Err(Error::validation(
                        "codec",
                        format!(
                            "'{codec}' is not supported; expected one of {}",
                            VIDEO_CODECS.join(", ")
                        ),
                    ));
                }
                params.codec = Some(codec);
            }
        }
        JobKind::AudioExtract => {
            params.bitrate = int_in(raw, "bitrate", 32, 1411)?.map(|v| v as u32);
        }
        JobKind::Thumbnail => {
            params.timestamp = float_in(raw, "timestamp", 0.0, 3600.0)?;
            params.width = int_in(raw, "width", 64, 1920)?.map(|v| v as u32);
            params.height = int_in(raw, "height", 64, 1080)?.map(|v| v as u32);
        }
        JobKind::Analyze => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Value coercion
// ---------------------------------------------------------------------------

/// The value for `key`, treating JSON `null` as absent.
fn present<'a>(raw: &'a RawParams, key: &str) -> Option<&'a Value> {
    raw.get(key).filter(|v| !v.is_null())
}

fn text(field: &str, value: &Value) -> Result<String> {
    let s = match value {
        Value::String(s) => s.trim().to_ascii_lowercase(),
        Value::Number(n) => n.to_string(),
        _ => return Err(Error::validation(field, "expected a string")),
    };
    if s.is_empty() {
        return Err(Error::validation(field, "must not be empty"));
    }
    Ok(s)
}

fn number(field: &str, value: &Value) -> Result<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(Error::validation(field, "expected a number")),
    }
}

fn int_in(raw: &RawParams, field: &str, min: i64, max: i64) -> Result<Option<i64>> {
    let Some(value) = present(raw, field) else {
        return Ok(None);
    };
    let v = number(field, value)?;
    if v.fract() != 0.0 {
        return Err(Error::validation(field, "expected a whole number"));
    }
    if v < min as f64 || v > max as f64 {
        return Err(Error::validation(
            field,
            format!("{v} is out of range {min}..={max}"),
        ));
    }
    Ok(Some(v as i64))
}

fn float_in(raw: &RawParams, field: &str, min: f64, max: f64) -> Result<Option<f64>> {
    let Some(value) = present(raw, field) else {
        return Ok(None);
    };
    let v = number(field, value)?;
    if !(min..=max).contains(&v) {
        return Err(Error::validation(
            field,
            format!("{v} is out of range {min}..={max}"),
        ));
    }
    Ok(Some(v))
}
