/// In-memory storage backend
///
/// Implements the full adapter contract against process-local maps.
/// Used as the substitutable fake in pipeline tests; never selected
/// from production configuration.
use crate::{
    clamp_ttl, CompletedPart, ObjectMeta, Result, StorageAdapter, StorageError, StorageObject,
    UploadResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    content_type: Option<String>,
    etag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Default)]
struct MultipartState {
    key: String,
    parts: BTreeMap<i32, Bytes>,
    meta: ObjectMeta,
}

#[derive(Default)]
pub struct MemoryAdapter {
    objects: RwLock<HashMap<String, StoredObject>>,
    uploads: RwLock<HashMap<String, MultipartState>>,
    upload_seq: AtomicU64,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects, for test assertions.
    pub fn object_count(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    fn etag_for(data: &[u8]) -> String {
        hex::encode(Sha1::digest(data))
    }

    fn store(&self, key: &str, data: Bytes, content_type: Option<String>) -> UploadResult {
        let etag = Self::etag_for(&data);
        self.objects.write().expect("lock poisoned").insert(
            key.to_string(),
            StoredObject {
                data,
                content_type,
                etag: etag.clone(),
                last_modified: Utc::now(),
            },
        );
        UploadResult {
            etag: Some(etag),
            version_id: None,
            url: None,
        }
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn download(&self, key: &str) -> Result<Bytes> {
        self.objects
            .read()
            .expect("lock poisoned")
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn upload(&self, key: &str, data: Bytes, meta: ObjectMeta) -> Result<UploadResult> {
        Ok(self.store(key, data, meta.content_type))
    }

    async fn presigned_put_url(&self, key: &str, ttl: Duration) -> Result<String> {
        Ok(format!(
            "memory://put/{key}?expires={}",
            clamp_ttl(ttl).as_secs()
        ))
    }

    async fn presigned_get_url(&self, key: &str, ttl: Duration) -> Result<String> {
        Ok(format!(
            "memory://get/{key}?expires={}",
            clamp_ttl(ttl).as_secs()
        ))
    }

    async fn init_multipart(&self, key: &str, meta: ObjectMeta) -> Result<String> {
        let upload_id = format!("mem-upload-{}", self.upload_seq.fetch_add(1, Ordering::SeqCst));
        self.uploads.write().expect("lock poisoned").insert(
            upload_id.clone(),
            MultipartState {
                key: key.to_string(),
                parts: BTreeMap::new(),
                meta,
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        if part_number < 1 {
            return Err(StorageError::InvalidRequest(format!(
                "part numbers are 1-based, got {part_number}"
            )));
        }

        let etag = Self::etag_for(&data);
        let mut uploads = self.uploads.write().expect("lock poisoned");
        let state = uploads
            .get_mut(upload_id)
            .ok_or_else(|| StorageError::NotFound(format!("upload {upload_id} for {key}")))?;
        state.parts.insert(part_number, data);

        Ok(CompletedPart { part_number, etag })
    }

    async fn presigned_part_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        ttl: Duration,
    ) -> Result<String> {
        Ok(format!(
            "memory://part/{key}?uploadId={upload_id}&partNumber={part_number}&expires={}",
            clamp_ttl(ttl).as_secs()
        ))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<UploadResult> {
        let state = self
            .uploads
            .write()
            .expect("lock poisoned")
            .remove(upload_id);

        let Some(state) = state else {
            // Idempotent re-complete: the upload id is gone but the
            // object landed on the first invocation.
            if self.exists(key).await? {
                return Ok(UploadResult {
                    etag: None,
                    version_id: None,
                    url: None,
                });
            }
            return Err(StorageError::NotFound(format!(
                "upload {upload_id} for {key}"
            )));
        };

        let mut assembled = Vec::new();
        for part in parts {
            let data = state.parts.get(&part.part_number).ok_or_else(|| {
                StorageError::InvalidRequest(format!(
                    "part {} was never uploaded for {key}",
                    part.part_number
                ))
            })?;
            assembled.extend_from_slice(data);
        }

        Ok(self.store(&state.key, Bytes::from(assembled), state.meta.content_type.clone()))
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.uploads
            .write()
            .expect("lock poisoned")
            .remove(upload_id);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().expect("lock poisoned").remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().expect("lock poisoned").contains_key(key))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<StorageObject>> {
        let objects = self.objects.read().expect("lock poisoned");
        let mut result: Vec<StorageObject> = objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, obj)| StorageObject {
                key: key.clone(),
                size: obj.data.len() as u64,
                last_modified: Some(obj.last_modified),
                etag: Some(obj.etag.clone()),
            })
            .collect();
        result.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(result)
    }

    async fn copy(&self, src_key: &str, dest_key: &str) -> Result<()> {
        let src = {
            let objects = self.objects.read().expect("lock poisoned");
            objects
                .get(src_key)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(src_key.to_string()))?
        };
        self.store(dest_key, src.data, src.content_type);
        Ok(())
    }
}
