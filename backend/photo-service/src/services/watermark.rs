//! Watermark compositor
//!
//! Applies an ordered list of text/logo layers onto the preview canvas.
//! Text is rendered onto a transparent overlay, alpha-scaled by the
//! layer opacity, then composited; logos arrive as prefetched bytes
//! (fetched async, under the SSRF guard, before the CPU-bound section)
//! and are downscaled so they never dominate the photo.

use crate::error::{AppError, Result};
use crate::models::{LayerKind, WatermarkConfig, WatermarkLayer, WatermarkPosition};
use crate::services::ssrf;
use bytes::Bytes;
use image::{imageops, DynamicImage, GenericImageView, RgbaImage};
use imageproc::drawing::draw_text_mut;
use rusttype::{Font, Scale};
use std::time::Duration;
use tracing::{debug, warn};

/// Logo edge relative to the canvas short edge.
const LOGO_MAX_FRACTION: u32 = 4;

pub struct WatermarkCompositor {
    font: Option<Font<'static>>,
}

impl WatermarkCompositor {
    /// Load the text-layer font once at startup. A missing font is not
    /// fatal here: text layers in layered configs degrade to a logged
    /// skip, logo layers are unaffected. A sole legacy text watermark
    /// is rejected at composite time instead.
    pub fn new(font_path: &str) -> Self {
        let font = match std::fs::read(font_path) {
            Ok(data) => match Font::try_from_vec(data) {
                Some(font) => Some(font),
                None => {
                    warn!(path = %font_path, "Watermark font is not a valid TrueType font");
                    None
                }
            },
            Err(e) => {
                warn!(path = %font_path, error = %e, "Watermark font not found, text layers disabled");
                None
            }
        };
        Self { font }
    }

    #[cfg(test)]
    pub fn without_font() -> Self {
        Self { font: None }
    }

    /// Composite all enabled layers in list order. `logos` is aligned
    /// with `config.layers`; `None` for a logo layer means its fetch
    /// failed and the layer is skipped (the legacy sole-layer case is
    /// rejected earlier, at fetch time).
    ///
    /// An unrenderable layer degrades to a logged skip in layered
    /// configs, but a sole legacy text layer with no font fails the
    /// job: the preview would otherwise come out unwatermarked while
    /// the photo reports success.
    pub fn composite(
        &self,
        canvas: &mut RgbaImage,
        config: &WatermarkConfig,
        logos: &[Option<DynamicImage>],
    ) -> Result<()> {
        for (index, layer) in config.layers.iter().enumerate() {
            if !layer.enabled {
                continue;
            }
            match layer.kind {
                LayerKind::Text => match &self.font {
                    Some(font) => render_text(canvas, layer, font),
                    None if config.legacy_single && config.layers.len() == 1 => {
                        return Err(AppError::Processing(
                            "legacy text watermark requires a loaded font".to_string(),
                        ));
                    }
                    None => {
                        warn!(layer = index, "Text layer skipped: no font loaded");
                    }
                },
                LayerKind::Logo => match logos.get(index).and_then(|l| l.as_ref()) {
                    Some(logo) => render_logo(canvas, layer, logo),
                    None => {
                        debug!(layer = index, "Logo layer unavailable, skipped");
                    }
                },
            }
        }
        Ok(())
    }
}

fn render_text(canvas: &mut RgbaImage, layer: &WatermarkLayer, font: &Font<'_>) {
    let (canvas_w, canvas_h) = canvas.dimensions();
    let font_px = text_font_size(canvas_w, canvas_h);
    let scale = Scale::uniform(font_px);
    let (text_w, text_h) = measure_text(font, scale, &layer.content);
    if text_w == 0 || text_h == 0 {
        return;
    }

    // Render at full opacity onto a tight transparent overlay, then
    // scale the overlay alpha so anti-aliased edges keep their ramp.
    let mut overlay = RgbaImage::new(text_w.min(canvas_w), text_h.min(canvas_h));
    draw_text_mut(
        &mut overlay,
        image::Rgba([255, 255, 255, 255]),
        0,
        0,
        scale,
        font,
        &layer.content,
    );
    scale_alpha(&mut overlay, layer.opacity);

    let margin = (font_px / 2.0).round() as u32;
    let (x, y) = anchor_offset(
        canvas_w,
        canvas_h,
        overlay.width(),
        overlay.height(),
        layer.position,
        margin,
    );
    imageops::overlay(canvas, &overlay, x as i64, y as i64);
}

fn render_logo(canvas: &mut RgbaImage, layer: &WatermarkLayer, logo: &DynamicImage) {
    let (canvas_w, canvas_h) = canvas.dimensions();
    let max_edge = (canvas_w.min(canvas_h) / LOGO_MAX_FRACTION).max(1);

    let (logo_w, logo_h) = logo.dimensions();
    let scaled = if logo_w > max_edge || logo_h > max_edge {
        logo.resize(max_edge, max_edge, imageops::FilterType::Triangle)
    } else {
        logo.clone()
    };

    let mut overlay = scaled.to_rgba8();
    scale_alpha(&mut overlay, layer.opacity);

    let margin = (canvas_w.min(canvas_h) / 40).max(4);
    let (x, y) = anchor_offset(
        canvas_w,
        canvas_h,
        overlay.width(),
        overlay.height(),
        layer.position,
        margin,
    );
    imageops::overlay(canvas, &overlay, x as i64, y as i64);
}

/// Font size proportional to the geometric mean of the canvas
/// dimensions, so watermarks read the same across portrait, landscape
/// and panorama inputs.
pub(crate) fn text_font_size(width: u32, height: u32) -> f32 {
    let geometric_mean = ((width as f64) * (height as f64)).sqrt();
    (geometric_mean * 0.04).clamp(12.0, 256.0) as f32
}

/// Anchor an item inside the canvas, clamped so the item never renders
/// off-canvas regardless of requested position, margin or item size.
pub(crate) fn anchor_offset(
    canvas_w: u32,
    canvas_h: u32,
    item_w: u32,
    item_h: u32,
    position: WatermarkPosition,
    margin: u32,
) -> (u32, u32) {
    let max_x = canvas_w.saturating_sub(item_w);
    let max_y = canvas_h.saturating_sub(item_h);
    let (x, y) = match position {
        WatermarkPosition::Center => (max_x / 2, max_y / 2),
        WatermarkPosition::TopLeft => (margin, margin),
        WatermarkPosition::TopRight => (max_x.saturating_sub(margin), margin),
        WatermarkPosition::BottomLeft => (margin, max_y.saturating_sub(margin)),
        WatermarkPosition::BottomRight => {
            (max_x.saturating_sub(margin), max_y.saturating_sub(margin))
        }
    };
    (x.min(max_x), y.min(max_y))
}

fn measure_text(font: &Font<'_>, scale: Scale, text: &str) -> (u32, u32) {
    let v_metrics = font.v_metrics(scale);
    let width = font
        .layout(text, scale, rusttype::point(0.0, v_metrics.ascent))
        .filter_map(|g| g.pixel_bounding_box())
        .map(|b| b.max.x)
        .max()
        .unwrap_or(0)
        .max(0) as u32;
    let height = (v_metrics.ascent - v_metrics.descent).ceil().max(0.0) as u32;
    (width, height)
}

fn scale_alpha(img: &mut RgbaImage, opacity: f32) {
    let opacity = opacity.clamp(0.0, 1.0);
    for pixel in img.pixels_mut() {
        pixel.0[3] = (pixel.0[3] as f32 * opacity).round() as u8;
    }
}

/// Fetches logo assets for watermark layers under the SSRF guard, a
/// request timeout and a hard byte ceiling.
pub struct LogoFetcher {
    http: reqwest::Client,
    max_bytes: u64,
}

impl LogoFetcher {
    pub fn new(timeout: Duration, max_bytes: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            // Redirects could hop to an internal address after
            // validation, so they are not followed.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AppError::Internal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { http, max_bytes })
    }

    /// Validate and download one logo, enforcing the byte ceiling while
    /// streaming so an over-sized response is cut off early.
    pub async fn fetch(&self, raw_url: &str) -> Result<Bytes> {
        let url = ssrf::validate_logo_url(raw_url).await?;

        let response = self.http.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Network(format!("logo fetch timed out: {raw_url}"))
            } else {
                AppError::Network(format!("logo fetch failed: {e}"))
            }
        })?;

        if !response.status().is_success() {
            return Err(AppError::Network(format!(
                "logo fetch for {raw_url} returned status {}",
                response.status()
            )));
        }

        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(AppError::Validation(format!(
                    "logo at {raw_url} is {len} bytes, ceiling is {}",
                    self.max_bytes
                )));
            }
        }

        use futures::StreamExt;
        let mut stream = response.bytes_stream();
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| AppError::Network(format!("logo download failed: {e}")))?;
            if (buf.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(AppError::Validation(format!(
                    "logo at {raw_url} exceeds the {} byte ceiling",
                    self.max_bytes
                )));
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(Bytes::from(buf))
    }

    /// Prefetch logos for every layer, aligned by index with
    /// `config.layers`. A failed fetch degrades that layer to `None`
    /// unless the config is a sole legacy watermark, where the job
    /// must fail rather than silently produce an unwatermarked preview.
    pub async fn prefetch(&self, config: &WatermarkConfig) -> Result<Vec<Option<Bytes>>> {
        let mut logos = Vec::with_capacity(config.layers.len());
        for (index, layer) in config.layers.iter().enumerate() {
            if !layer.enabled || layer.kind != LayerKind::Logo {
                logos.push(None);
                continue;
            }
            match self.fetch(&layer.content).await {
                Ok(bytes) => logos.push(Some(bytes)),
                Err(e) => {
                    if config.legacy_single && config.layers.len() == 1 {
                        return Err(AppError::Processing(format!(
                            "legacy watermark logo failed to load: {e}"
                        )));
                    }
                    warn!(layer = index, error = %e, "Logo layer failed to load, skipping");
                    logos.push(None);
                }
            }
        }
        Ok(logos)
    }
}
