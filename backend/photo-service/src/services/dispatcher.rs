//! Job dispatcher
//!
//! Handles one claimed processing job end to end: status transitions
//! on the photo record, original download, the CPU pipeline, and the
//! paired derivative uploads. Derivative keys are a pure function of
//! the photo id, so redelivered jobs overwrite in place instead of
//! accumulating orphans.

use crate::db::{AlbumStore, PhotoStore};
use crate::error::{AppError, Result};
use crate::models::{DerivedAsset, PhotoJob, PhotoStatus};
use crate::queue::JobHandler;
use crate::services::processor::ImageProcessor;
use crate::services::watermark::LogoFetcher;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use storage_adapter::{ObjectMeta, StorageAdapter};
use tracing::{info, warn};

pub fn thumb_key(photo_id: uuid::Uuid) -> String {
    format!("thumbs/{photo_id}.jpg")
}

pub fn preview_key(photo_id: uuid::Uuid) -> String {
    format!("previews/{photo_id}.jpg")
}

pub struct ProcessPhotoHandler {
    storage: Arc<dyn StorageAdapter>,
    photos: Arc<dyn PhotoStore>,
    albums: Arc<dyn AlbumStore>,
    processor: ImageProcessor,
    logo_fetcher: LogoFetcher,
}

impl ProcessPhotoHandler {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        photos: Arc<dyn PhotoStore>,
        albums: Arc<dyn AlbumStore>,
        processor: ImageProcessor,
        logo_fetcher: LogoFetcher,
    ) -> Self {
        Self {
            storage,
            photos,
            albums,
            processor,
            logo_fetcher,
        }
    }

    async fn run(&self, job: &PhotoJob) -> Result<DerivedAsset> {
        let watermark = self.albums.watermark_config(job.album_id).await?;
        watermark
            .validate()
            .map_err(|e| AppError::Validation(format!("watermark config rejected: {e}")))?;

        let original = self.storage.download(&job.original_key).await?;

        let logos = if watermark.enabled {
            self.logo_fetcher.prefetch(&watermark).await?
        } else {
            Vec::new()
        };

        let output = self
            .processor
            .process(original, watermark, logos)
            .await?;

        let thumb_key = thumb_key(job.photo_id);
        let preview_key = preview_key(job.photo_id);
        let meta = ObjectMeta::with_content_type("image/jpeg");

        // Both uploads must land before the record flips to completed.
        futures::try_join!(
            self.storage
                .upload(&thumb_key, Bytes::from(output.thumb), meta.clone()),
            self.storage
                .upload(&preview_key, Bytes::from(output.preview), meta),
        )?;

        Ok(DerivedAsset {
            thumb_key,
            preview_key,
            width: output.width,
            height: output.height,
            blur_hash: output.blur_hash,
            exif: serde_json::to_value(&output.exif)?,
            file_size: output.file_size,
            mime_type: output.mime_type,
            captured_at: output.exif.captured_at.unwrap_or_else(chrono::Utc::now),
        })
    }
}

#[async_trait]
impl JobHandler for ProcessPhotoHandler {
    async fn handle(&self, job: &PhotoJob) -> Result<()> {
        let Some(asset) = self.photos.get(job.photo_id).await? else {
            // Record deleted since enqueue. Permanent; no retry value.
            return Err(AppError::NotFound(format!(
                "photo {} no longer exists",
                job.photo_id
            )));
        };

        // Redelivery of an already completed photo is a no-op.
        if PhotoStatus::from_str(&asset.status) == Some(PhotoStatus::Completed) {
            info!(photo_id = %job.photo_id, "Photo already completed, skipping redelivery");
            return Ok(());
        }

        self.photos.mark_processing(job.photo_id).await?;

        match self.run(job).await {
            Ok(derived) => {
                self.photos.mark_completed(job.photo_id, &derived).await?;
                info!(
                    photo_id = %job.photo_id,
                    width = derived.width,
                    height = derived.height,
                    "Photo processed"
                );
                Ok(())
            }
            Err(e) => {
                // Record the failure before the queue decides on retry;
                // a failed DB write must not mask the original error.
                if let Err(db_err) = self.photos.mark_failed(job.photo_id).await {
                    warn!(photo_id = %job.photo_id, error = %db_err, "Failed to mark photo failed");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivative_keys_are_deterministic() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(thumb_key(id), thumb_key(id));
        assert_eq!(thumb_key(id), format!("thumbs/{id}.jpg"));
        assert_eq!(preview_key(id), format!("previews/{id}.jpg"));
        assert_ne!(thumb_key(id), preview_key(id));
    }
}
