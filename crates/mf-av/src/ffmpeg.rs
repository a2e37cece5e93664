//! ffmpeg/ffprobe-backed engine for audio, video, thumbnails and analysis.
//!
//! Each call runs in its own temporary directory: the input bytes are
//! written to `input`, ffmpeg writes `output.<format>`, and the directory is
//! removed when the call returns or is dropped. Dropping the future kills
//! the child process.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mf_core::params::DEFAULT_THUMBNAIL_FORMAT;
use mf_core::{JobKind, Params};
use tempfile::TempDir;

use crate::command::ToolCommand;
use crate::engine::{Engine, EngineError, ProgressFn};
use crate::tools::ToolRegistry;

/// Upper bound on a single tool run; the orchestrator's per-kind deadline
/// is normally much shorter.
const TOOL_TIMEOUT: Duration = Duration::from_secs(6 * 3600);

pub struct FfmpegEngine {
    tools: ToolRegistry,
}

impl FfmpegEngine {
    pub fn new(tools: ToolRegistry) -> Self {
        Self { tools }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Source duration in seconds, when ffprobe can tell.
    async fn probe_duration(&self, input: &Path) -> Option<f64> {
        let ffprobe = self.tools.require("ffprobe").ok()?;
        let output = ToolCommand::new(ffprobe.path.clone())
            .args(["-v", "error", "-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(input.to_string_lossy())
            .timeout(Duration::from_secs(60))
            .execute()
            .await
            .ok()?;
        output.stdout_lossy().trim().parse::<f64>().ok()
    }

    async fn analyze(&self, input: &Path) -> Result<Bytes, EngineError> {
        let ffprobe = self.tools.require("ffprobe")?;
        let output = ToolCommand::new(ffprobe.path.clone())
            .args(["-v", "quiet", "-print_format", "json"])
            .args(["-show_format", "-show_streams"])
            .arg(input.to_string_lossy())
            .timeout(TOOL_TIMEOUT)
            .execute()
            .await?;

        // ffprobe exits 0 with an empty object on some unreadable inputs.
        let json: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| EngineError::Fatal(format!("ffprobe returned invalid JSON: {e}")))?;
        if json.get("format").is_none() {
            return Err(EngineError::Fatal(
                "ffprobe could not read the input format".into(),
            ));
        }
        Ok(Bytes::from(output.stdout))
    }

    async fn transcode(
        &self,
        dir: &TempDir,
        input: &Path,
        kind: JobKind,
        params: &Params,
        progress: &ProgressFn,
    ) -> Result<Bytes, EngineError> {
        let ffmpeg = self.tools.require("ffmpeg")?;
        let duration = match kind {
            JobKind::Thumbnail => None,
            _ => self.probe_duration(input).await,
        };

        let output = dir.path().join(format!("output.{}", output_extension(kind, params)));
        let mut cmd = ToolCommand::new(ffmpeg.path.clone());
        cmd.timeout(TOOL_TIMEOUT)
            .args(["-y", "-nostdin", "-progress", "pipe:2", "-nostats"])
            .args(build_args(kind, params, input, &output));

        let mut last_out_us: Option<i64> = None;
        cmd.execute_with_stderr_callback(|line| {
            if let Some(val) = line.strip_prefix("out_time_us=") {
                last_out_us = val.trim().parse::<i64>().ok();
            } else if line.starts_with("progress=") {
                if let (Some(us), Some(total)) = (last_out_us, duration) {
                    if total > 0.0 {
                        let pct = (us as f64 / 1_000_000.0 / total).clamp(0.0, 1.0);
                        progress(pct as f32);
                    }
                }
            }
        })
        .await?;

        let bytes = tokio::fs::read(&output).await.map_err(|e| {
            EngineError::Fatal(format!("ffmpeg produced no output file: {e}"))
        })?;
        if bytes.is_empty() {
            return Err(EngineError::Fatal("ffmpeg produced an empty output".into()));
        }
        Ok(Bytes::from(bytes))
    }
}

#[async_trait]
impl Engine for FfmpegEngine {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn convert(
        &self,
        input: Bytes,
        kind: JobKind,
        params: &Params,
        progress: &ProgressFn,
    ) -> Result<Bytes, EngineError> {
        let dir = TempDir::new()
            .map_err(|e| EngineError::Retryable(format!("failed to create temp dir: {e}")))?;
        let input_path = dir.path().join("input");
        tokio::fs::write(&input_path, &input)
            .await
            .map_err(|e| EngineError::Retryable(format!("failed to stage input: {e}")))?;

        let result = match kind {
            JobKind::Analyze => self.analyze(&input_path).await,
            JobKind::ImageConvert
            | JobKind::AudioConvert
            | JobKind::VideoConvert
            | JobKind::AudioExtract
            | JobKind::Thumbnail => {
                self.transcode(&dir, &input_path, kind, params, progress)
                    .await
            }
        };
        if result.is_ok() {
            progress(1.0);
        }
        result
    }

    fn interruptible(&self) -> bool {
        true
    }
}

/// Extension (and thus muxer) of the output file.
pub fn output_extension(kind: JobKind, params: &Params) -> String {
    match (kind, params.format()) {
        (_, Some(format)) => format.to_string(),
        (JobKind::Thumbnail, None) => DEFAULT_THUMBNAIL_FORMAT.to_string(),
        (JobKind::AudioExtract, None) => "mp3".to_string(),
        (JobKind::AudioConvert, None) => "wav".to_string(),
        (JobKind::VideoConvert, None) => "mp4".to_string(),
        (JobKind::ImageConvert, None) => "png".to_string(),
        (JobKind::Analyze, None) => "json".to_string(),
    }
}

/// ffmpeg encoder for a validated codec family.
pub fn video_encoder(codec: &str) -> Option<&'static str> {
    match codec {
        "h264" => Some("libx264"),
        "h265" => Some("libx265"),
        "vp8" => Some("libvpx"),
        "vp9" => Some("libvpx-vp9"),
        "av1" => Some("libaom-av1"),
        _ => None,
    }
}

fn scale_filter(width: Option<u32>, height: Option<u32>) -> Option<String> {
    match (width, height) {
        (None, None) => None,
        (w, h) => Some(format!(
            "scale={}:{}",
            w.map_or("-2".to_string(), |v| v.to_string()),
            h.map_or("-2".to_string(), |v| v.to_string())
        )),
    }
}

/// Arguments after the global flags: input, per-kind options, output.
pub fn build_args(kind: JobKind, params: &Params, input: &Path, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    if kind == JobKind::Thumbnail {
        if let Some(ts) = params.timestamp {
            args.extend(["-ss".into(), format!("{ts}")]);
        }
    }
    args.extend(["-i".into(), input.to_string_lossy().into_owned()]);

    match kind {
        JobKind::AudioConvert => {
            args.push("-vn".into());
            if let Some(kbps) = params.bitrate {
                args.extend(["-b:a".into(), format!("{kbps}k")]);
            }
            if let Some(rate) = params.sample_rate {
                args.extend(["-ar".into(), rate.to_string()]);
            }
            if let Some(ch) = params.channels {
                args.extend(["-ac".into(), ch.to_string()]);
            }
        }
        JobKind::AudioExtract => {
            args.push("-vn".into());
            if let Some(kbps) = params.bitrate {
                args.extend(["-b:a".into(), format!("{kbps}k")]);
            }
        }
        JobKind::VideoConvert => {
            if let Some(encoder) = params.codec.as_deref().and_then(video_encoder) {
                args.extend(["-c:v".into(), encoder.into()]);
            }
            if let Some(kbps) = params.bitrate {
                args.extend(["-b:v".into(), format!("{kbps}k")]);
            }
            if let Some(filter) = scale_filter(params.width, params.height) {
                args.extend(["-vf".into(), filter]);
            }
            if let Some(fps) = params.frame_rate {
                args.extend(["-r".into(), format!("{fps}")]);
            }
        }
        JobKind::Thumbnail => {
            args.extend(["-frames:v".into(), "1".into()]);
            if let Some(filter) = scale_filter(params.width, params.height) {
                args.extend(["-vf".into(), filter]);
            }
        }
        JobKind::ImageConvert => {
            if let Some(filter) = scale_filter(params.width, params.height) {
                args.extend(["-vf".into(), filter]);
            }
        }
        JobKind::Analyze => {}
    }

    args.push(output.to_string_lossy().into_owned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::no_progress;
    use std::path::PathBuf;

    fn paths() -> (PathBuf, PathBuf) {
        (PathBuf::from("/w/input"), PathBuf::from("/w/output.mp4"))
    }

    #[test]
    fn video_args() {
        let (i, o) = paths();
        let params = Params {
            format: Some("mp4".into()),
            codec: Some("h265".into()),
            bitrate: Some(2500),
            width: Some(1280),
            frame_rate: Some(30.0),
            ..Params::default()
        };
        let args = build_args(JobKind::VideoConvert, &params, &i, &o);
        let joined = args.join(" ");
        assert!(joined.starts_with("-i /w/input"));
        assert!(joined.contains("-c:v libx265"));
        assert!(joined.contains("-b:v 2500k"));
        assert!(joined.contains("-vf scale=1280:-2"));
        assert!(joined.contains("-r 30"));
        assert!(joined.ends_with("/w/output.mp4"));
    }

    #[test]
    fn thumbnail_seeks_before_input() {
        let (i, o) = paths();
        let params = Params {
            timestamp: Some(12.5),
            ..Params::default()
        };
        let args = build_args(JobKind::Thumbnail, &params, &i, &o);
        assert_eq!(&args[..4], &["-ss", "12.5", "-i", "/w/input"]);
        assert!(args.contains(&"-frames:v".to_string()));
        assert_eq!(output_extension(JobKind::Thumbnail, &params), "jpg");
    }

    #[test]
    fn audio_args_drop_video() {
        let (i, o) = paths();
        let params = Params {
            format: Some("ogg".into()),
            bitrate: Some(128),
            sample_rate: Some(44100),
            channels: Some(2),
            ..Params::default()
        };
        let args = build_args(JobKind::AudioConvert, &params, &i, &o).join(" ");
        assert!(args.contains("-vn -b:a 128k -ar 44100 -ac 2"));
        assert_eq!(output_extension(JobKind::AudioConvert, &params), "ogg");
    }

    #[test]
    fn thumbnail_extension_follows_the_shared_default() {
        assert_eq!(
            output_extension(JobKind::Thumbnail, &Params::default()),
            DEFAULT_THUMBNAIL_FORMAT
        );
    }

    #[test]
    fn encoder_mapping() {
        assert_eq!(video_encoder("vp9"), Some("libvpx-vp9"));
        assert_eq!(video_encoder("mpeg2"), None);
    }

    #[tokio::test]
    async fn missing_ffmpeg_is_unavailable() {
        let engine = FfmpegEngine::new(ToolRegistry::default());
        let err = engine
            .convert(
                Bytes::from_static(b"RIFF"),
                JobKind::AudioConvert,
                &Params::default(),
                &no_progress(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
        assert!(engine.interruptible());
    }
}
