//! Pure-Rust raster engine for `image-convert` jobs, built on the `image`
//! crate. Decoding and encoding run on the blocking pool.

use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use mf_core::{JobKind, Params};

use crate::engine::{Engine, EngineError, ProgressFn};

/// Quality used for lossy JPEG output when none was requested.
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Largest edge the ICO container can hold.
const ICO_MAX_EDGE: u32 = 256;

#[derive(Debug, Clone, Copy, Default)]
pub struct RasterEngine;

impl RasterEngine {
    pub fn new() -> Self {
        Self
    }
}

/// Map a validated format name to the `image` crate's format.
pub fn image_format(format: &str) -> Option<ImageFormat> {
    match format {
        "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
        "png" => Some(ImageFormat::Png),
        "webp" => Some(ImageFormat::WebP),
        "bmp" => Some(ImageFormat::Bmp),
        "gif" => Some(ImageFormat::Gif),
        "tif" | "tiff" => Some(ImageFormat::Tiff),
        "ico" => Some(ImageFormat::Ico),
        _ => None,
    }
}

fn resize(img: DynamicImage, width: Option<u32>, height: Option<u32>) -> DynamicImage {
    match (width, height) {
        (Some(w), Some(h)) => img.resize_exact(w, h, FilterType::Lanczos3),
        (Some(w), None) => img.resize(w, u32::MAX, FilterType::Lanczos3),
        (None, Some(h)) => img.resize(u32::MAX, h, FilterType::Lanczos3),
        (None, None) => img,
    }
}

/// Decode, resize and re-encode. Synchronous; call from a blocking context.
pub fn convert_image(input: &[u8], params: &Params) -> Result<Vec<u8>, EngineError> {
    let format_name = params
        .format()
        .ok_or_else(|| EngineError::Fatal("no target format".into()))?;
    let format = image_format(format_name)
        .ok_or_else(|| EngineError::Fatal(format!("unsupported image format '{format_name}'")))?;

    let img = image::load_from_memory(input)
        .map_err(|e| EngineError::Fatal(format!("failed to decode image: {e}")))?;
    let mut img = resize(img, params.width, params.height);

    if format == ImageFormat::Ico && (img.width() > ICO_MAX_EDGE || img.height() > ICO_MAX_EDGE) {
        img = img.resize(ICO_MAX_EDGE, ICO_MAX_EDGE, FilterType::Lanczos3);
    }

    let mut buf = Cursor::new(Vec::new());
    match format {
        ImageFormat::Jpeg => {
            let quality = params.quality.unwrap_or(DEFAULT_JPEG_QUALITY);
            let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
            DynamicImage::ImageRgb8(img.to_rgb8())
                .write_with_encoder(encoder)
                .map_err(|e| EngineError::Fatal(format!("failed to encode jpeg: {e}")))?;
        }
        _ => {
            img.write_to(&mut buf, format)
                .map_err(|e| EngineError::Fatal(format!("failed to encode {format_name}: {e}")))?;
        }
    }
    Ok(buf.into_inner())
}

#[async_trait]
impl Engine for RasterEngine {
    fn name(&self) -> &str {
        "raster"
    }

    async fn convert(
        &self,
        input: Bytes,
        kind: JobKind,
        params: &Params,
        progress: &ProgressFn,
    ) -> Result<Bytes, EngineError> {
        if kind != JobKind::ImageConvert {
            return Err(EngineError::Unavailable(format!(
                "raster engine cannot run {kind} jobs"
            )));
        }

        let params = params.clone();
        let out = tokio::task::spawn_blocking(move || convert_image(&input, &params))
            .await
            .map_err(|e| EngineError::Retryable(format!("image task failed: {e}")))??;
        progress(1.0);
        Ok(Bytes::from(out))
    }

    /// The blocking task is abandoned, not stopped, but it has no side
    /// effects: its output is simply dropped.
    fn interruptible(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::no_progress;

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let mut img = image::RgbaImage::new(w, h);
        for pixel in img.pixels_mut() {
            *pixel = image::Rgba([200, 30, 30, 255]);
        }
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn params(format: &str) -> Params {
        Params {
            format: Some(format.into()),
            ..Params::default()
        }
    }

    #[test]
    fn png_to_webp() {
        let out = convert_image(&png_bytes(8, 8), &params("webp")).unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::WebP);
    }

    #[test]
    fn rgba_to_jpeg_with_quality() {
        let mut p = params("jpg");
        p.quality = Some(40);
        let out = convert_image(&png_bytes(8, 8), &p).unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn resize_keeps_aspect_with_one_edge() {
        let mut p = params("png");
        p.width = Some(10);
        let out = convert_image(&png_bytes(20, 40), &p).unwrap();
        let img = image::load_from_memory(&out).unwrap();
        assert_eq!((img.width(), img.height()), (10, 20));
    }

    #[test]
    fn garbage_input_is_fatal() {
        let err = convert_image(b"definitely not an image", &params("png")).unwrap_err();
        assert!(matches!(err, EngineError::Fatal(_)));
    }

    #[tokio::test]
    async fn engine_rejects_other_kinds() {
        let err = RasterEngine::new()
            .convert(
                Bytes::from(png_bytes(2, 2)),
                JobKind::Thumbnail,
                &params("jpg"),
                &no_progress(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
    }
}
