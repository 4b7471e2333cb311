/// Album repository - read-only watermark configuration lookup
///
/// Albums own their watermark settings; this core only reads them. Two
/// storage shapes exist side by side: the current layered JSON config
/// and a legacy single-watermark row (`watermark_type` + flat fields).
/// Both normalize into `WatermarkConfig` here so the compositor never
/// sees the difference.
use crate::error::Result;
use crate::models::{LayerKind, WatermarkConfig, WatermarkLayer, WatermarkPosition};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[async_trait]
pub trait AlbumStore: Send + Sync {
    /// Watermark configuration for an album. Returns a disabled config
    /// when the album has none.
    async fn watermark_config(&self, album_id: Uuid) -> Result<WatermarkConfig>;
}

pub struct PgAlbumStore {
    pool: PgPool,
}

impl PgAlbumStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AlbumStore for PgAlbumStore {
    async fn watermark_config(&self, album_id: Uuid) -> Result<WatermarkConfig> {
        let row = sqlx::query(
            r#"
            SELECT watermark_enabled, watermark_type, watermark_config
            FROM albums
            WHERE id = $1
            "#,
        )
        .bind(album_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(WatermarkConfig::default());
        };

        let enabled: bool = row.try_get("watermark_enabled").unwrap_or(false);
        let watermark_type: Option<String> = row.try_get("watermark_type").ok();
        let raw_config: Option<serde_json::Value> = row.try_get("watermark_config").ok();

        Ok(normalize(enabled, watermark_type.as_deref(), raw_config))
    }
}

/// Normalize the stored shape into a layered config.
pub fn normalize(
    enabled: bool,
    watermark_type: Option<&str>,
    raw_config: Option<serde_json::Value>,
) -> WatermarkConfig {
    if !enabled {
        return WatermarkConfig::default();
    }

    let Some(raw) = raw_config else {
        return WatermarkConfig::default();
    };

    // Current shape: {"layers": [...]}
    if raw.get("layers").is_some() {
        let mut config: WatermarkConfig = serde_json::from_value(raw).unwrap_or_default();
        config.enabled = true;
        config.legacy_single = false;
        return config;
    }

    // Legacy shape: watermark_type + flat {content, opacity, position}
    let kind = match watermark_type {
        Some("logo") => LayerKind::Logo,
        _ => LayerKind::Text,
    };
    let content = raw
        .get("content")
        .or_else(|| raw.get("text"))
        .or_else(|| raw.get("url"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    if content.is_empty() {
        return WatermarkConfig::default();
    }

    let opacity = raw
        .get("opacity")
        .and_then(|v| v.as_f64())
        .map(|v| v as f32)
        .unwrap_or(0.6);
    let position = raw
        .get("position")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or(WatermarkPosition::BottomRight);

    WatermarkConfig {
        enabled: true,
        layers: vec![WatermarkLayer {
            kind,
            content,
            opacity,
            position,
            enabled: true,
        }],
        legacy_single: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_disabled_album_yields_disabled_config() {
        let config = normalize(false, Some("text"), Some(json!({"content": "x"})));
        assert!(!config.enabled);
        assert!(config.layers.is_empty());
    }

    #[test]
    fn test_layered_config_passthrough() {
        let raw = json!({
            "layers": [
                {"kind": "text", "content": "© studio", "opacity": 0.4, "position": "center"},
                {"kind": "logo", "content": "https://cdn.example.com/logo.png"}
            ]
        });
        let config = normalize(true, None, Some(raw));
        assert!(config.enabled);
        assert!(!config.legacy_single);
        assert_eq!(config.layers.len(), 2);
        assert_eq!(config.layers[0].kind, LayerKind::Text);
        assert_eq!(config.layers[1].kind, LayerKind::Logo);
    }

    #[test]
    fn test_legacy_single_text_row() {
        let config = normalize(
            true,
            Some("text"),
            Some(json!({"text": "© 2026", "opacity": 0.8, "position": "bottom-left"})),
        );
        assert!(config.enabled);
        assert!(config.legacy_single);
        assert_eq!(config.layers.len(), 1);
        assert_eq!(config.layers[0].content, "© 2026");
        assert_eq!(config.layers[0].position, WatermarkPosition::BottomLeft);
    }

    #[test]
    fn test_legacy_logo_row_uses_url_field() {
        let config = normalize(
            true,
            Some("logo"),
            Some(json!({"url": "https://cdn.example.com/logo.png"})),
        );
        assert_eq!(config.layers[0].kind, LayerKind::Logo);
        assert_eq!(config.layers[0].content, "https://cdn.example.com/logo.png");
    }

    #[test]
    fn test_legacy_row_without_content_disables() {
        let config = normalize(true, Some("text"), Some(json!({"opacity": 0.5})));
        assert!(!config.enabled);
    }
}
