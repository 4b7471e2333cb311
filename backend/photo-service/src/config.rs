/// Configuration management for photo-service
///
/// Loads configuration from environment variables with sensible defaults.
/// Adapters and pools are constructed once at process start from this
/// config and passed by reference into the dispatcher and packager.
use serde::Deserialize;
use storage_adapter::StorageConfig;

use crate::error::{AppError, Result};

#[derive(Clone, Debug)]
pub struct Config {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub queue: QueueConfig,
    pub processor: ProcessorConfig,
    pub packager: PackagerConfig,
    pub storage: StorageConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    /// Key namespace so several deployments can share one Redis.
    pub namespace: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct QueueConfig {
    /// Concurrent job slots per worker process.
    pub concurrency: usize,
    /// Job starts per second (sliding-window limit on downstream load).
    pub rate_per_second: u32,
    /// Retry budget including the first attempt.
    pub max_attempts: u32,
    /// Base delay for exponential backoff.
    pub backoff_base_ms: u64,
    /// Claimed jobs older than this are considered stalled and
    /// re-queued (at-least-once delivery).
    pub stall_timeout_secs: u64,
    /// Dead-letter list retention (entries, not time).
    pub dead_letter_retention: usize,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProcessorConfig {
    /// Thumbnail max edge in pixels.
    pub thumb_max_edge: u32,
    pub thumb_quality: u8,
    /// Preview max edge in pixels.
    pub preview_max_edge: u32,
    pub preview_quality: u8,
    /// TrueType font used for text watermark layers.
    pub watermark_font_path: String,
    /// Timeout for remote logo fetches.
    pub logo_fetch_timeout_secs: u64,
    /// Ceiling on downloaded logo bytes.
    pub logo_max_bytes: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PackagerConfig {
    /// Bounded fan-out while assembling one archive.
    pub concurrency: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgresql://localhost/gallery".to_string()),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
            },
            redis: RedisConfig {
                url: std::env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://localhost".to_string()),
                namespace: std::env::var("QUEUE_NAMESPACE")
                    .unwrap_or_else(|_| "gallery".to_string()),
            },
            queue: QueueConfig {
                concurrency: env_parse("QUEUE_CONCURRENCY", 5),
                rate_per_second: env_parse("QUEUE_RATE_PER_SECOND", 10),
                max_attempts: env_parse("QUEUE_MAX_ATTEMPTS", 3),
                backoff_base_ms: env_parse("QUEUE_BACKOFF_BASE_MS", 2000),
                stall_timeout_secs: env_parse("QUEUE_STALL_TIMEOUT_SECS", 120),
                dead_letter_retention: env_parse("QUEUE_DEAD_LETTER_RETENTION", 1000),
            },
            processor: ProcessorConfig {
                thumb_max_edge: env_parse("THUMB_MAX_EDGE", 400),
                thumb_quality: env_parse("THUMB_QUALITY", 80),
                preview_max_edge: env_parse("PREVIEW_MAX_EDGE", 2560),
                preview_quality: env_parse("PREVIEW_QUALITY", 90),
                watermark_font_path: std::env::var("WATERMARK_FONT_PATH").unwrap_or_else(|_| {
                    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf".to_string()
                }),
                logo_fetch_timeout_secs: env_parse("LOGO_FETCH_TIMEOUT_SECS", 10),
                logo_max_bytes: env_parse("LOGO_MAX_BYTES", 10 * 1024 * 1024),
            },
            packager: PackagerConfig {
                concurrency: env_parse("PACKAGER_CONCURRENCY", 4),
            },
            storage: StorageConfig::from_env().map_err(AppError::Storage)?,
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        std::env::set_var("TEST_ENV_PARSE_GARBAGE", "not-a-number");
        assert_eq!(env_parse("TEST_ENV_PARSE_GARBAGE", 7u32), 7);
        std::env::remove_var("TEST_ENV_PARSE_GARBAGE");
        assert_eq!(env_parse("TEST_ENV_PARSE_MISSING", 42usize), 42);
    }
}
