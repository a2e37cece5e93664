//! # mf-av
//!
//! Conversion engines for the mediaforge orchestrator.
//!
//! - **Engine seam** ([`Engine`], [`EngineError`]) -- the black-box
//!   `convert(bytes, kind, params)` contract and its error classification.
//! - **Tool discovery** ([`ToolRegistry`]) -- find ffmpeg and ffprobe.
//! - **Command execution** ([`ToolCommand`]) -- async process builder with
//!   timeout, stderr streaming, and kill-on-drop.
//! - **Engines** -- [`FfmpegEngine`] for audio/video/thumbnail/analyze,
//!   [`RasterEngine`] for images, and [`MediaEngine`] routing between them.

pub mod command;
pub mod engine;
pub mod ffmpeg;
pub mod raster;
pub mod router;
pub mod tools;

pub use command::{ToolCommand, ToolError, ToolOutput};
pub use engine::{condense_stderr, no_progress, Engine, EngineError, ProgressFn};
pub use ffmpeg::FfmpegEngine;
pub use raster::RasterEngine;
pub use router::MediaEngine;
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
