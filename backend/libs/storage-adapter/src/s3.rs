/// S3-compatible backend (AWS S3 and MinIO)
///
/// MinIO is addressed through the same AWS SDK client with an endpoint
/// override and path-style addressing, so one adapter serves both the
/// local-compatible service and the cloud provider.
use crate::{
    clamp_ttl, rewrite_to_public, CompletedPart, ObjectMeta, Result, StorageAdapter,
    StorageConfig, StorageError, StorageObject, UploadResult,
};
use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart as S3CompletedPart,
};
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::time::Duration;

pub struct S3Adapter {
    client: Client,
    bucket: String,
    public_endpoint: Option<String>,
}

impl S3Adapter {
    /// Build the SDK client from configuration.
    ///
    /// Credentials fall back to the default provider chain when not set
    /// explicitly (IAM roles in production).
    pub async fn connect(cfg: &StorageConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(cfg.region.clone()));

        if let (Some(access_key_id), Some(secret_access_key)) =
            (&cfg.access_key_id, &cfg.secret_access_key)
        {
            let credentials = Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "storage_adapter",
            );
            loader = loader.credentials_provider(credentials);
        }

        if let Some(endpoint) = &cfg.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(cfg.force_path_style)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: cfg.bucket.clone(),
            public_endpoint: cfg.public_endpoint.clone(),
        })
    }

    fn maybe_public(&self, url: String) -> Result<String> {
        match &self.public_endpoint {
            Some(endpoint) => rewrite_to_public(&url, endpoint),
            None => Ok(url),
        }
    }

    fn presign_config(ttl: Duration) -> Result<PresigningConfig> {
        PresigningConfig::builder()
            .expires_in(clamp_ttl(ttl))
            .build()
            .map_err(|e| StorageError::Backend(format!("failed to build presigning config: {e}")))
    }
}

#[async_trait]
impl StorageAdapter for S3Adapter {
    /// Bucket connectivity and credential check, one cheap list call.
    async fn health_check(&self) -> Result<()> {
        self.client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| map_sdk_err("health_check", &self.bucket, e))?;

        tracing::info!(bucket = %self.bucket, "S3 connection validated");
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_err("download", key, e))?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Transient(format!("failed to read body of {key}: {e}")))?;

        Ok(body.into_bytes())
    }

    async fn upload(&self, key: &str, data: Bytes, meta: ObjectMeta) -> Result<UploadResult> {
        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(data.into());

        if let Some(content_type) = &meta.content_type {
            req = req.content_type(content_type);
        }
        for (k, v) in &meta.metadata {
            req = req.metadata(k, v);
        }

        let response = req.send().await.map_err(|e| map_sdk_err("upload", key, e))?;

        Ok(UploadResult {
            etag: response.e_tag().map(|s| s.to_string()),
            version_id: response.version_id().map(|s| s.to_string()),
            url: None,
        })
    }

    async fn presigned_put_url(&self, key: &str, ttl: Duration) -> Result<String> {
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(Self::presign_config(ttl)?)
            .await
            .map_err(|e| map_sdk_err("presigned_put_url", key, e))?;

        self.maybe_public(presigned.uri().to_string())
    }

    async fn presigned_get_url(&self, key: &str, ttl: Duration) -> Result<String> {
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(Self::presign_config(ttl)?)
            .await
            .map_err(|e| map_sdk_err("presigned_get_url", key, e))?;

        self.maybe_public(presigned.uri().to_string())
    }

    async fn init_multipart(&self, key: &str, meta: ObjectMeta) -> Result<String> {
        let mut req = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key);

        if let Some(content_type) = &meta.content_type {
            req = req.content_type(content_type);
        }
        for (k, v) in &meta.metadata {
            req = req.metadata(k, v);
        }

        let response = req
            .send()
            .await
            .map_err(|e| map_sdk_err("init_multipart", key, e))?;

        response
            .upload_id()
            .map(|s| s.to_string())
            .ok_or_else(|| StorageError::Backend(format!("no upload id returned for {key}")))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(data.into())
            .send()
            .await
            .map_err(|e| map_sdk_err("upload_part", key, e))?;

        let etag = response
            .e_tag()
            .map(|s| s.to_string())
            .ok_or_else(|| StorageError::Backend(format!("no etag for part {part_number} of {key}")))?;

        Ok(CompletedPart { part_number, etag })
    }

    async fn presigned_part_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        ttl: Duration,
    ) -> Result<String> {
        let presigned = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .presigned(Self::presign_config(ttl)?)
            .await
            .map_err(|e| map_sdk_err("presigned_part_url", key, e))?;

        self.maybe_public(presigned.uri().to_string())
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<UploadResult> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|p| {
                        S3CompletedPart::builder()
                            .part_number(p.part_number)
                            .e_tag(&p.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        let result = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await;

        match result {
            Ok(response) => Ok(UploadResult {
                etag: response.e_tag().map(|s| s.to_string()),
                version_id: response.version_id().map(|s| s.to_string()),
                url: None,
            }),
            // A prior completion consumes the upload id. If the object
            // now exists, re-completion is a no-op rather than an error.
            Err(e) if error_code_is(&e, "NoSuchUpload") => {
                if self.exists(key).await? {
                    tracing::debug!(key = %key, upload_id = %upload_id,
                        "multipart upload already completed, treating as no-op");
                    Ok(UploadResult {
                        etag: None,
                        version_id: None,
                        url: None,
                    })
                } else {
                    Err(map_sdk_err("complete_multipart", key, e))
                }
            }
            Err(e) => Err(map_sdk_err("complete_multipart", key, e)),
        }
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| map_sdk_err("abort_multipart", key, e))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_err("delete", key, e))?;

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match map_sdk_err("exists", key, e) {
                StorageError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<StorageObject>> {
        let mut objects = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| map_sdk_err("list_objects", prefix, e))?;
            for obj in page.contents() {
                let Some(key) = obj.key() else { continue };
                objects.push(StorageObject {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    last_modified: obj
                        .last_modified()
                        .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
                    etag: obj.e_tag().map(|s| s.trim_matches('"').to_string()),
                });
            }
        }

        Ok(objects)
    }

    async fn copy(&self, src_key: &str, dest_key: &str) -> Result<()> {
        let copy_source = format!("{}/{}", self.bucket, src_key);

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(copy_source)
            .key(dest_key)
            .send()
            .await
            .map_err(|e| map_sdk_err("copy", src_key, e))?;

        Ok(())
    }
}

fn error_code_is<E>(err: &SdkError<E>, code: &str) -> bool
where
    E: ProvideErrorMetadata,
{
    matches!(err, SdkError::ServiceError(ctx) if ctx.err().code() == Some(code))
}

/// Map SDK errors onto the adapter taxonomy. Timeouts, connection
/// failures, throttling and 5xx responses are transient; missing keys
/// surface as `NotFound`; credential problems as `Auth`.
fn map_sdk_err<E>(op: &str, key: &str, err: SdkError<E>) -> StorageError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            StorageError::Transient(format!("{op} {key}: {err:?}"))
        }
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            let code = ctx.err().code().unwrap_or_default();

            if status == 404 || code == "NoSuchKey" || code == "NotFound" {
                StorageError::NotFound(key.to_string())
            } else if status >= 500 || status == 429 || code == "SlowDown" {
                StorageError::Transient(format!("{op} {key}: {code} (status {status})"))
            } else if status == 401 || status == 403 {
                StorageError::Auth(format!("{op} {key}: {code} (status {status})"))
            } else {
                StorageError::Backend(format!("{op} {key}: {code} (status {status})"))
            }
        }
        _ => StorageError::Backend(format!("{op} {key}: {err:?}")),
    }
}
