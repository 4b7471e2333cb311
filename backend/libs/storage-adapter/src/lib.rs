//! Storage Adapter
//!
//! Uniform contract over heterogeneous object-storage backends (MinIO,
//! AWS S3, Alibaba-style OSS). Every caller in the pipeline goes through
//! the [`StorageAdapter`] trait; no component reaches a storage SDK
//! directly, and the concrete backend is chosen exactly once at process
//! start via [`from_config`].

pub mod config;
pub mod memory;
pub mod oss;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use config::{StorageBackend, StorageConfig};
pub use memory::MemoryAdapter;
pub use oss::OssAdapter;
pub use s3::S3Adapter;

/// Ceiling for presigned URL lifetimes. Presigned URLs are short-lived
/// direct-access grants; anything beyond an hour widens the exposure
/// window without a legitimate use case in this pipeline.
pub const MAX_PRESIGN_TTL: Duration = Duration::from_secs(3600);

/// Default presigned URL expiry time (15 minutes)
pub const DEFAULT_PRESIGN_TTL: Duration = Duration::from_secs(900);

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage error taxonomy.
///
/// `Transient` failures (network blips, backend 5xx, throttling) are
/// safe to retry; everything else is permanent from the caller's point
/// of view.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("storage auth error: {0}")]
    Auth(String),

    #[error("invalid storage request: {0}")]
    InvalidRequest(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

/// Object descriptor returned from listing/existence calls.
/// Never persisted by this crate.
#[derive(Clone, Debug)]
pub struct StorageObject {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

/// Metadata attached to an uploaded object
#[derive(Clone, Debug, Default)]
pub struct ObjectMeta {
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl ObjectMeta {
    pub fn with_content_type(content_type: &str) -> Self {
        Self {
            content_type: Some(content_type.to_string()),
            metadata: HashMap::new(),
        }
    }
}

/// Result of a completed upload (simple or multipart)
#[derive(Clone, Debug)]
pub struct UploadResult {
    pub etag: Option<String>,
    pub version_id: Option<String>,
    pub url: Option<String>,
}

/// One uploaded part of a multipart upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

/// Backend-agnostic object storage contract.
///
/// All backends implement this one trait; callers never branch on the
/// backend type. Multipart completion is idempotent: re-invoking
/// `complete_multipart` with the same part list after a prior success
/// is a no-op, not an error.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Download an object. Fails with `NotFound` if the key is absent.
    async fn download(&self, key: &str) -> Result<Bytes>;

    /// Upload an object, overwriting any existing object at `key`.
    async fn upload(&self, key: &str, data: Bytes, meta: ObjectMeta) -> Result<UploadResult>;

    /// Time-boxed direct-upload URL. `ttl` is clamped to [`MAX_PRESIGN_TTL`].
    async fn presigned_put_url(&self, key: &str, ttl: Duration) -> Result<String>;

    /// Time-boxed direct-download URL. `ttl` is clamped to [`MAX_PRESIGN_TTL`].
    async fn presigned_get_url(&self, key: &str, ttl: Duration) -> Result<String>;

    /// Start a multipart upload, returning the upload id.
    async fn init_multipart(&self, key: &str, meta: ObjectMeta) -> Result<String>;

    /// Upload one part (1-based `part_number`).
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<CompletedPart>;

    /// Time-boxed URL for a client-direct part upload.
    async fn presigned_part_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        ttl: Duration,
    ) -> Result<String>;

    /// Finalize a multipart upload. Idempotent on re-invocation after
    /// a prior success with the same part list.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<UploadResult>;

    /// Abandon a multipart upload and discard its parts.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()>;

    /// Delete an object. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check whether an object exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// List objects under a key prefix.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<StorageObject>>;

    /// Server-side copy within the bucket.
    async fn copy(&self, src_key: &str, dest_key: &str) -> Result<()>;

    /// Connectivity/credential probe, called once at worker startup so
    /// a misconfigured deployment fails fast instead of failing every
    /// job. The probed key is not expected to exist.
    async fn health_check(&self) -> Result<()> {
        self.exists(".storage-health-probe").await.map(|_| ())
    }
}

/// Construct the configured storage backend.
///
/// Called once at process start; the returned adapter is shared
/// read-only across all worker slots.
pub async fn from_config(cfg: &StorageConfig) -> Result<Arc<dyn StorageAdapter>> {
    let adapter: Arc<dyn StorageAdapter> = match cfg.backend {
        StorageBackend::Minio | StorageBackend::S3 => Arc::new(S3Adapter::connect(cfg).await?),
        StorageBackend::Oss => Arc::new(OssAdapter::new(cfg)?),
    };

    tracing::info!(
        backend = cfg.backend.as_str(),
        bucket = %cfg.bucket,
        "Storage adapter initialized"
    );

    Ok(adapter)
}

/// Clamp a requested presign TTL into [1s, MAX_PRESIGN_TTL].
pub(crate) fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.clamp(Duration::from_secs(1), MAX_PRESIGN_TTL)
}

/// Rewrite a presigned URL so its scheme/host/port match the externally
/// reachable endpoint. The path and signed query string are preserved;
/// backends sign with path-style addressing so the signature stays
/// valid across the host swap.
pub(crate) fn rewrite_to_public(url_str: &str, public_endpoint: &str) -> Result<String> {
    let mut parsed = url::Url::parse(url_str)
        .map_err(|e| StorageError::Backend(format!("invalid presigned URL: {e}")))?;
    let public = url::Url::parse(public_endpoint).map_err(|e| {
        StorageError::InvalidRequest(format!("invalid public endpoint {public_endpoint}: {e}"))
    })?;

    parsed
        .set_scheme(public.scheme())
        .map_err(|_| StorageError::Backend("failed to rewrite URL scheme".to_string()))?;
    parsed
        .set_host(public.host_str())
        .map_err(|e| StorageError::Backend(format!("failed to rewrite URL host: {e}")))?;
    parsed
        .set_port(public.port())
        .map_err(|_| StorageError::Backend("failed to rewrite URL port".to_string()))?;

    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_ttl_bounds() {
        assert_eq!(clamp_ttl(Duration::from_secs(0)), Duration::from_secs(1));
        assert_eq!(clamp_ttl(Duration::from_secs(600)), Duration::from_secs(600));
        // Days-scale requests collapse to the hour ceiling
        assert_eq!(clamp_ttl(Duration::from_secs(86_400 * 7)), MAX_PRESIGN_TTL);
    }

    #[test]
    fn test_rewrite_to_public_swaps_host_keeps_query() {
        let signed = "http://minio:9000/photos/originals/a.jpg?X-Amz-Signature=abc&X-Amz-Expires=900";
        let rewritten = rewrite_to_public(signed, "https://cdn.example.com").unwrap();
        assert_eq!(
            rewritten,
            "https://cdn.example.com/photos/originals/a.jpg?X-Amz-Signature=abc&X-Amz-Expires=900"
        );
    }

    #[test]
    fn test_rewrite_to_public_with_port() {
        let signed = "http://minio:9000/photos/a.jpg?sig=1";
        let rewritten = rewrite_to_public(signed, "http://gallery.local:8443").unwrap();
        assert!(rewritten.starts_with("http://gallery.local:8443/photos/a.jpg"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::Transient("x".into()).is_transient());
        assert!(!StorageError::NotFound("x".into()).is_transient());
        assert!(!StorageError::Auth("x".into()).is_transient());
    }
}
