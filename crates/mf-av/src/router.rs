//! Routes each job kind to the engine that can serve it.

use async_trait::async_trait;
use bytes::Bytes;
use mf_core::config::ToolsConfig;
use mf_core::{JobKind, Params};

use crate::engine::{Engine, EngineError, ProgressFn};
use crate::ffmpeg::FfmpegEngine;
use crate::raster::RasterEngine;
use crate::tools::ToolRegistry;

/// The production engine: raster images in-process, everything else
/// through ffmpeg/ffprobe.
pub struct MediaEngine {
    raster: RasterEngine,
    ffmpeg: FfmpegEngine,
}

impl MediaEngine {
    pub fn new(tools: ToolRegistry) -> Self {
        Self {
            raster: RasterEngine::new(),
            ffmpeg: FfmpegEngine::new(tools),
        }
    }

    /// Discover tools from configuration and build the engine.
    pub fn discover(config: &ToolsConfig) -> Self {
        let tools = ToolRegistry::discover(config);
        for info in tools.check_all() {
            if !info.available {
                tracing::warn!(tool = %info.name, "Tool not found; dependent job kinds will fail");
            }
        }
        Self::new(tools)
    }

    pub fn tools(&self) -> &ToolRegistry {
        self.ffmpeg.tools()
    }

    fn route(&self, kind: JobKind) -> &dyn Engine {
        match kind {
            JobKind::ImageConvert => &self.raster,
            JobKind::AudioConvert
            | JobKind::VideoConvert
            | JobKind::AudioExtract
            | JobKind::Thumbnail
            | JobKind::Analyze => &self.ffmpeg,
        }
    }
}

#[async_trait]
impl Engine for MediaEngine {
    fn name(&self) -> &str {
        "media"
    }

    async fn convert(
        &self,
        input: Bytes,
        kind: JobKind,
        params: &Params,
        progress: &ProgressFn,
    ) -> Result<Bytes, EngineError> {
        let engine = self.route(kind);
        tracing::trace!(engine = engine.name(), %kind, "Dispatching conversion");
        engine.convert(input, kind, params, progress).await
    }

    fn interruptible(&self) -> bool {
        self.raster.interruptible() && self.ffmpeg.interruptible()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::no_progress;

    #[test]
    fn routes_by_kind() {
        let engine = MediaEngine::new(ToolRegistry::default());
        assert_eq!(engine.route(JobKind::ImageConvert).name(), "raster");
        for kind in [
            JobKind::AudioConvert,
            JobKind::VideoConvert,
            JobKind::AudioExtract,
            JobKind::Thumbnail,
            JobKind::Analyze,
        ] {
            assert_eq!(engine.route(kind).name(), "ffmpeg");
        }
        assert!(engine.interruptible());
    }

    #[tokio::test]
    async fn video_without_ffmpeg_is_unavailable() {
        let engine = MediaEngine::new(ToolRegistry::default());
        let err = engine
            .convert(
                Bytes::from_static(b"\x00\x00\x00\x18ftypmp42"),
                JobKind::VideoConvert,
                &Params::default(),
                &no_progress(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
    }
}
