/// Configuration for the object-storage adapter
///
/// Loads configuration from environment variables with sensible defaults.
/// The backend is selected once at process start; callers receive an
/// `Arc<dyn StorageAdapter>` and never branch on the backend kind again.
use crate::StorageError;

/// Closed set of supported storage backends.
///
/// `Minio` and `S3` share the AWS SDK client (MinIO is S3-compatible and
/// only differs by endpoint + path-style addressing); `Oss` talks to an
/// Alibaba-style OSS service over header-signed HTTP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Minio,
    S3,
    Oss,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minio => "minio",
            Self::S3 => "s3",
            Self::Oss => "oss",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s.to_ascii_lowercase().as_str() {
            "minio" => Ok(Self::Minio),
            "s3" => Ok(Self::S3),
            "oss" | "alioss" => Ok(Self::Oss),
            other => Err(StorageError::InvalidRequest(format!(
                "unknown storage backend: {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub bucket: String,
    pub region: String,
    /// Service endpoint for MinIO / OSS (e.g. "http://minio:9000" or
    /// "oss-cn-hangzhou.aliyuncs.com"). Unset for plain AWS S3.
    pub endpoint: Option<String>,
    /// Externally reachable endpoint. When set, presigned URLs are
    /// rewritten to this host before being handed to callers outside
    /// the internal network.
    pub public_endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Path-style addressing, required by MinIO.
    pub force_path_style: bool,
}

impl StorageConfig {
    /// Load storage configuration from environment variables
    pub fn from_env() -> Result<Self, StorageError> {
        let backend = StorageBackend::parse(
            &std::env::var("STORAGE_BACKEND").unwrap_or_else(|_| "minio".to_string()),
        )?;

        Ok(Self {
            backend,
            bucket: std::env::var("STORAGE_BUCKET").unwrap_or_else(|_| "photos".to_string()),
            region: std::env::var("STORAGE_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            endpoint: std::env::var("STORAGE_ENDPOINT").ok(),
            public_endpoint: std::env::var("STORAGE_PUBLIC_ENDPOINT").ok(),
            access_key_id: std::env::var("STORAGE_ACCESS_KEY_ID").ok(),
            secret_access_key: std::env::var("STORAGE_SECRET_ACCESS_KEY").ok(),
            force_path_style: matches!(backend, StorageBackend::Minio)
                || std::env::var("STORAGE_FORCE_PATH_STYLE")
                    .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse() {
        assert_eq!(StorageBackend::parse("minio").unwrap(), StorageBackend::Minio);
        assert_eq!(StorageBackend::parse("S3").unwrap(), StorageBackend::S3);
        assert_eq!(StorageBackend::parse("alioss").unwrap(), StorageBackend::Oss);
        assert!(StorageBackend::parse("gcs").is_err());
    }
}
