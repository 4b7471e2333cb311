/// Data models for the photo-processing pipeline
///
/// This module defines structures for:
/// - PhotoJob: the queue payload driving one processing run
/// - PhotoAsset: the externally persisted photo record (subset of fields
///   this core reads/writes)
/// - WatermarkConfig: album-owned watermark layers, read-only here
/// - ExifMeta: structured capture metadata
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue job payload. Attempt counters live in queue job state, not
/// in the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoJob {
    pub photo_id: Uuid,
    pub album_id: Uuid,
    pub original_key: String,
}

/// Photo status in the processing lifecycle.
///
/// `Failed → Processing` is the only re-entry transition and is driven
/// by the retry policy, never by user action on the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhotoStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PhotoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Subset of the externally persisted photo record this core touches.
///
/// Invariant: `status = completed` implies `thumb_key` and `preview_key`
/// are set and the objects exist in storage.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PhotoAsset {
    pub id: Uuid,
    pub album_id: Uuid,
    pub original_key: String,
    pub thumb_key: Option<String>,
    pub preview_key: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub blur_hash: Option<String>,
    pub exif: Option<serde_json::Value>,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
    pub status: String,
}

/// Derived fields persisted when a processing run completes.
#[derive(Debug, Clone)]
pub struct DerivedAsset {
    pub thumb_key: String,
    pub preview_key: String,
    pub width: u32,
    pub height: u32,
    pub blur_hash: String,
    pub exif: serde_json::Value,
    pub file_size: i64,
    pub mime_type: String,
    /// Sourced from EXIF, falling back to processing time.
    pub captured_at: DateTime<Utc>,
}

/// Watermark layer kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Text,
    Logo,
}

/// Anchor position for a watermark layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WatermarkPosition {
    Center,
    TopLeft,
    TopRight,
    #[default]
    BottomRight,
    BottomLeft,
}

/// One text or logo overlay with its own opacity, anchor and enabled
/// flag, composited onto the preview in list order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkLayer {
    pub kind: LayerKind,
    /// Text content for text layers, logo URL for logo layers.
    pub content: String,
    #[serde(default = "default_opacity")]
    pub opacity: f32,
    #[serde(default)]
    pub position: WatermarkPosition,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_opacity() -> f32 {
    0.6
}

fn default_enabled() -> bool {
    true
}

/// Album-owned watermark configuration. Immutable input per processing
/// run; this core only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WatermarkConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub layers: Vec<WatermarkLayer>,
    /// Set when the config was normalized from a legacy single-watermark
    /// row. A failed sole legacy layer fails the job instead of
    /// degrading to an unwatermarked preview.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub legacy_single: bool,
}

impl WatermarkConfig {
    /// Validate opacity bounds and layer contents up front so a bad
    /// config surfaces as a permanent validation error, not a mid-job
    /// surprise.
    pub fn validate(&self) -> Result<(), String> {
        for (i, layer) in self.layers.iter().enumerate() {
            if !(0.0..=1.0).contains(&layer.opacity) {
                return Err(format!(
                    "layer {i}: opacity {} outside [0, 1]",
                    layer.opacity
                ));
            }
            if layer.content.trim().is_empty() {
                return Err(format!("layer {i}: empty content"));
            }
        }
        Ok(())
    }
}

/// Structured capture metadata extracted from the original.
///
/// Every field is optional; malformed or absent EXIF degrades to an
/// empty record, never a job failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExifMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lens_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iso: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposure_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub f_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focal_length: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
}

impl ExifMeta {
    pub fn is_empty(&self) -> bool {
        *self == ExifMeta::default()
    }
}
