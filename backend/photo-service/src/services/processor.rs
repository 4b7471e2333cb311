//! Image processing core
//!
//! One processing run takes the original bytes plus the album watermark
//! config and produces everything the photo record needs: a thumbnail,
//! a watermarked preview, intrinsic dimensions, a BlurHash placeholder
//! and EXIF capture metadata. The whole run is pure CPU work and
//! executes on the blocking pool; logo bytes are prefetched by the
//! caller before entry.

use crate::config::ProcessorConfig;
use crate::error::{AppError, Result};
use crate::models::{ExifMeta, LayerKind, WatermarkConfig};
use crate::services::watermark::WatermarkCompositor;
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, DynamicImage, GenericImageView, ImageFormat};
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, warn};

/// BlurHash component grid. 4x3 matches the common landscape aspect
/// and stays under the 30-char budget most clients expect.
const BLURHASH_COMPONENTS: (u32, u32) = (4, 3);
/// BlurHash is computed on a downscaled copy; encoding cost is
/// quadratic in pixel count and the hash only carries low frequencies.
const BLURHASH_MAX_EDGE: u32 = 64;

/// Everything derived from one original.
pub struct ProcessOutput {
    pub thumb: Vec<u8>,
    pub preview: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub blur_hash: String,
    pub exif: ExifMeta,
    pub mime_type: String,
    pub file_size: i64,
}

pub struct ImageProcessor {
    config: ProcessorConfig,
    compositor: Arc<WatermarkCompositor>,
}

impl ImageProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        let compositor = Arc::new(WatermarkCompositor::new(&config.watermark_font_path));
        Self { config, compositor }
    }

    #[cfg(test)]
    pub fn for_tests(config: ProcessorConfig) -> Self {
        Self {
            compositor: Arc::new(WatermarkCompositor::without_font()),
            config,
        }
    }

    /// Run the full pipeline on the blocking pool. `logos` is aligned
    /// by index with `watermark.layers` (prefetched bytes for logo
    /// layers, `None` elsewhere).
    pub async fn process(
        &self,
        original: Bytes,
        watermark: WatermarkConfig,
        logos: Vec<Option<Bytes>>,
    ) -> Result<ProcessOutput> {
        let config = self.config.clone();
        let compositor = self.compositor.clone();

        tokio::task::spawn_blocking(move || {
            process_blocking(&config, &compositor, original, watermark, logos)
        })
        .await
        .map_err(|e| AppError::Internal(format!("image task panicked: {e}")))?
    }
}

fn process_blocking(
    config: &ProcessorConfig,
    compositor: &WatermarkCompositor,
    original: Bytes,
    watermark: WatermarkConfig,
    logos: Vec<Option<Bytes>>,
) -> Result<ProcessOutput> {
    let file_size = original.len() as i64;
    let format = image::guess_format(&original)
        .map_err(|e| AppError::Processing(format!("unrecognized image format: {e}")))?;
    let mime_type = mime_for(format);

    let decoded = image::load_from_memory_with_format(&original, format)
        .map_err(|e| AppError::Processing(format!("failed to decode image: {e}")))?;
    let (width, height) = decoded.dimensions();

    // EXIF and BlurHash are tolerant: failure degrades, never aborts.
    let exif = extract_exif(&original);
    let blur_hash = compute_blurhash(&decoded).unwrap_or_else(|e| {
        warn!(error = %e, "BlurHash encoding failed, storing empty placeholder");
        String::new()
    });

    let thumb = encode_variant(
        &decoded,
        config.thumb_max_edge,
        config.thumb_quality,
        None,
        compositor,
        &[],
    )?;

    let logo_images = decode_logos(&watermark, logos)?;
    let watermark_input = watermark.enabled.then_some(&watermark);
    let preview = encode_variant(
        &decoded,
        config.preview_max_edge,
        config.preview_quality,
        watermark_input,
        compositor,
        &logo_images,
    )?;

    Ok(ProcessOutput {
        thumb,
        preview,
        width,
        height,
        blur_hash,
        exif,
        mime_type,
        file_size,
    })
}

/// Downscale-if-needed, optionally watermark, encode as JPEG.
fn encode_variant(
    source: &DynamicImage,
    max_edge: u32,
    quality: u8,
    watermark: Option<&WatermarkConfig>,
    compositor: &WatermarkCompositor,
    logos: &[Option<DynamicImage>],
) -> Result<Vec<u8>> {
    let resized = downscale_to_fit(source, max_edge);

    let rgb = match watermark {
        Some(config) => {
            let mut canvas = resized.to_rgba8();
            compositor.composite(&mut canvas, config, logos)?;
            DynamicImage::ImageRgba8(canvas).to_rgb8()
        }
        None => resized.to_rgb8(),
    };

    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut Cursor::new(&mut buf), quality)
        .encode_image(&DynamicImage::ImageRgb8(rgb))
        .map_err(|e| AppError::Processing(format!("JPEG encoding failed: {e}")))?;
    Ok(buf)
}

/// Fit within `max_edge` on the longest side; never upscale.
pub(crate) fn downscale_to_fit(source: &DynamicImage, max_edge: u32) -> DynamicImage {
    let (w, h) = source.dimensions();
    if w <= max_edge && h <= max_edge {
        return source.clone();
    }
    source.resize(max_edge, max_edge, imageops::FilterType::Lanczos3)
}

fn decode_logos(
    watermark: &WatermarkConfig,
    logos: Vec<Option<Bytes>>,
) -> Result<Vec<Option<DynamicImage>>> {
    let mut decoded = Vec::with_capacity(logos.len());
    for (index, bytes) in logos.into_iter().enumerate() {
        let Some(bytes) = bytes else {
            decoded.push(None);
            continue;
        };
        match image::load_from_memory(&bytes) {
            Ok(img) => decoded.push(Some(img)),
            Err(e) => {
                let sole_legacy = watermark.legacy_single && watermark.layers.len() == 1;
                if sole_legacy {
                    return Err(AppError::Processing(format!(
                        "legacy watermark logo is not a decodable image: {e}"
                    )));
                }
                warn!(layer = index, error = %e, "Logo bytes failed to decode, layer skipped");
                decoded.push(None);
            }
        }
    }
    // Text-only configs arrive with an empty logo vector.
    if decoded.len() < watermark.layers.len() {
        decoded.resize_with(watermark.layers.len(), || None);
    }
    Ok(decoded)
}

fn compute_blurhash(image: &DynamicImage) -> std::result::Result<String, String> {
    let small = downscale_to_fit(image, BLURHASH_MAX_EDGE);
    let rgba = small.to_rgba8();
    let (w, h) = rgba.dimensions();
    blurhash::encode(
        BLURHASH_COMPONENTS.0,
        BLURHASH_COMPONENTS.1,
        w,
        h,
        rgba.as_raw(),
    )
    .map_err(|e| e.to_string())
}

/// Best-effort EXIF extraction. Anything malformed yields an empty
/// record.
pub(crate) fn extract_exif(bytes: &[u8]) -> ExifMeta {
    let mut cursor = Cursor::new(bytes);
    let reader = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(reader) => reader,
        Err(e) => {
            debug!(error = %e, "No EXIF data readable from original");
            return ExifMeta::default();
        }
    };

    let text_field = |tag: exif::Tag| -> Option<String> {
        reader
            .get_field(tag, exif::In::PRIMARY)
            .map(|f| f.display_value().to_string().trim_matches('"').to_string())
            .filter(|s| !s.is_empty())
    };

    let iso = reader
        .get_field(exif::Tag::PhotographicSensitivity, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0));

    let captured_at = text_field(exif::Tag::DateTimeOriginal)
        .or_else(|| text_field(exif::Tag::DateTime))
        .and_then(|raw| parse_exif_datetime(&raw));

    ExifMeta {
        make: text_field(exif::Tag::Make),
        model: text_field(exif::Tag::Model),
        lens_model: text_field(exif::Tag::LensModel),
        iso,
        exposure_time: text_field(exif::Tag::ExposureTime),
        f_number: text_field(exif::Tag::FNumber),
        focal_length: text_field(exif::Tag::FocalLength),
        captured_at,
    }
}

/// EXIF timestamps carry no zone; they are recorded as UTC.
pub(crate) fn parse_exif_datetime(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw.trim(), "%Y:%m:%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn mime_for(format: ImageFormat) -> String {
    match format {
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::Png => "image/png",
        ImageFormat::WebP => "image/webp",
        ImageFormat::Gif => "image/gif",
        ImageFormat::Tiff => "image/tiff",
        ImageFormat::Bmp => "image/bmp",
        ImageFormat::Avif => "image/avif",
        _ => "application/octet-stream",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{WatermarkLayer, WatermarkPosition};

    fn test_config() -> ProcessorConfig {
        ProcessorConfig {
            thumb_max_edge: 100,
            thumb_quality: 80,
            preview_max_edge: 400,
            preview_quality: 90,
            watermark_font_path: "/nonexistent/font.ttf".to_string(),
            logo_fetch_timeout_secs: 1,
            logo_max_bytes: 1024,
        }
    }

    fn jpeg_fixture(width: u32, height: u32) -> Bytes {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }));
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut Cursor::new(&mut buf), 90)
            .encode_image(&img)
            .unwrap();
        Bytes::from(buf)
    }

    #[tokio::test]
    async fn test_process_produces_all_derived_fields() {
        let processor = ImageProcessor::for_tests(test_config());
        let output = processor
            .process(jpeg_fixture(800, 600), WatermarkConfig::default(), vec![])
            .await
            .unwrap();

        assert_eq!(output.width, 800);
        assert_eq!(output.height, 600);
        assert_eq!(output.mime_type, "image/jpeg");
        assert!(!output.thumb.is_empty());
        assert!(!output.preview.is_empty());
        assert!(!output.blur_hash.is_empty());
        assert!(output.file_size > 0);

        let thumb = image::load_from_memory(&output.thumb).unwrap();
        assert_eq!(thumb.dimensions().0.max(thumb.dimensions().1), 100);
        let preview = image::load_from_memory(&output.preview).unwrap();
        assert_eq!(preview.dimensions().0.max(preview.dimensions().1), 400);
    }

    #[tokio::test]
    async fn test_small_original_is_never_upscaled() {
        let processor = ImageProcessor::for_tests(test_config());
        let output = processor
            .process(jpeg_fixture(60, 40), WatermarkConfig::default(), vec![])
            .await
            .unwrap();

        let thumb = image::load_from_memory(&output.thumb).unwrap();
        assert_eq!(thumb.dimensions(), (60, 40));
        let preview = image::load_from_memory(&output.preview).unwrap();
        assert_eq!(preview.dimensions(), (60, 40));
    }

    #[tokio::test]
    async fn test_processing_is_deterministic() {
        let processor = ImageProcessor::for_tests(test_config());
        let fixture = jpeg_fixture(500, 300);
        let a = processor
            .process(fixture.clone(), WatermarkConfig::default(), vec![])
            .await
            .unwrap();
        let b = processor
            .process(fixture, WatermarkConfig::default(), vec![])
            .await
            .unwrap();

        assert_eq!(a.thumb, b.thumb);
        assert_eq!(a.preview, b.preview);
        assert_eq!(a.blur_hash, b.blur_hash);
    }

    #[tokio::test]
    async fn test_garbage_bytes_fail_as_processing_error() {
        let processor = ImageProcessor::for_tests(test_config());
        let result = processor
            .process(
                Bytes::from_static(b"definitely not an image"),
                WatermarkConfig::default(),
                vec![],
            )
            .await;
        assert!(matches!(result, Err(AppError::Processing(_))));
    }

    #[tokio::test]
    async fn test_undecodable_logo_fails_sole_legacy_layer() {
        let processor = ImageProcessor::for_tests(test_config());
        let config = WatermarkConfig {
            enabled: true,
            layers: vec![WatermarkLayer {
                kind: LayerKind::Logo,
                content: "https://cdn.example.com/logo.png".to_string(),
                opacity: 0.5,
                position: WatermarkPosition::BottomRight,
                enabled: true,
            }],
            legacy_single: true,
        };
        let result = processor
            .process(
                jpeg_fixture(200, 200),
                config,
                vec![Some(Bytes::from_static(b"not a png"))],
            )
            .await;
        assert!(matches!(result, Err(AppError::Processing(_))));
    }

    #[tokio::test]
    async fn test_missing_font_fails_sole_legacy_text_layer() {
        // Mirrors the sole-legacy logo rule: with no font loaded the
        // text cannot render, and a silent skip would mark the photo
        // completed with an unwatermarked preview.
        let processor = ImageProcessor::for_tests(test_config());
        let config = WatermarkConfig {
            enabled: true,
            layers: vec![WatermarkLayer {
                kind: LayerKind::Text,
                content: "© studio".to_string(),
                opacity: 0.5,
                position: WatermarkPosition::BottomRight,
                enabled: true,
            }],
            legacy_single: true,
        };
        let result = processor.process(jpeg_fixture(200, 200), config, vec![]).await;
        assert!(matches!(result, Err(AppError::Processing(_))));
    }

    #[tokio::test]
    async fn test_missing_font_skips_text_layer_in_layered_config() {
        let processor = ImageProcessor::for_tests(test_config());
        let config = WatermarkConfig {
            enabled: true,
            layers: vec![
                WatermarkLayer {
                    kind: LayerKind::Text,
                    content: "© studio".to_string(),
                    opacity: 0.5,
                    position: WatermarkPosition::BottomRight,
                    enabled: true,
                },
                WatermarkLayer {
                    kind: LayerKind::Text,
                    content: "sample".to_string(),
                    opacity: 0.5,
                    position: WatermarkPosition::TopLeft,
                    enabled: true,
                },
            ],
            legacy_single: false,
        };
        let result = processor.process(jpeg_fixture(200, 200), config, vec![]).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_undecodable_logo_skipped_in_layered_config() {
        let processor = ImageProcessor::for_tests(test_config());
        let config = WatermarkConfig {
            enabled: true,
            layers: vec![
                WatermarkLayer {
                    kind: LayerKind::Logo,
                    content: "https://cdn.example.com/logo.png".to_string(),
                    opacity: 0.5,
                    position: WatermarkPosition::BottomRight,
                    enabled: true,
                },
                WatermarkLayer {
                    kind: LayerKind::Logo,
                    content: "https://cdn.example.com/other.png".to_string(),
                    opacity: 0.5,
                    position: WatermarkPosition::TopLeft,
                    enabled: true,
                },
            ],
            legacy_single: false,
        };
        let result = processor
            .process(
                jpeg_fixture(200, 200),
                config,
                vec![Some(Bytes::from_static(b"broken")), None],
            )
            .await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_exif_tolerates_exif_free_jpeg() {
        let meta = extract_exif(&jpeg_fixture(32, 32));
        assert!(meta.is_empty());
    }

    #[test]
    fn test_exif_datetime_parsing() {
        let parsed = parse_exif_datetime("2026:03:15 14:30:00").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-03-15T14:30:00+00:00");
        assert!(parse_exif_datetime("March 15, 2026").is_none());
        assert!(parse_exif_datetime("").is_none());
    }

    #[test]
    fn test_downscale_preserves_aspect() {
        let img = DynamicImage::new_rgb8(1000, 500);
        let out = downscale_to_fit(&img, 200);
        assert_eq!(out.dimensions(), (200, 100));
    }
}
