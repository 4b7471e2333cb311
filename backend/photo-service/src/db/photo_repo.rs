/// Photo repository - status transitions and derived-field persistence
use crate::error::Result;
use crate::models::{DerivedAsset, PhotoAsset, PhotoStatus};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

/// Read/update access to the externally persisted photo record.
#[async_trait]
pub trait PhotoStore: Send + Sync {
    async fn get(&self, photo_id: Uuid) -> Result<Option<PhotoAsset>>;

    /// Claim transition: `pending|failed → processing`.
    async fn mark_processing(&self, photo_id: Uuid) -> Result<()>;

    /// Failure transition. Always written before the error propagates
    /// so the record reflects reality while the queue decides on retry.
    async fn mark_failed(&self, photo_id: Uuid) -> Result<()>;

    /// Success transition, persisting all derived fields in one write.
    async fn mark_completed(&self, photo_id: Uuid, derived: &DerivedAsset) -> Result<()>;
}

pub struct PgPhotoStore {
    pool: PgPool,
}

impl PgPhotoStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn set_status(&self, photo_id: Uuid, status: PhotoStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE photos
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(photo_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl PhotoStore for PgPhotoStore {
    async fn get(&self, photo_id: Uuid) -> Result<Option<PhotoAsset>> {
        let asset = sqlx::query_as::<_, PhotoAsset>(
            r#"
            SELECT id, album_id, original_key, thumb_key, preview_key,
                   width, height, blur_hash, exif, file_size, mime_type,
                   captured_at, status
            FROM photos
            WHERE id = $1
            "#,
        )
        .bind(photo_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(asset)
    }

    async fn mark_processing(&self, photo_id: Uuid) -> Result<()> {
        self.set_status(photo_id, PhotoStatus::Processing).await
    }

    async fn mark_failed(&self, photo_id: Uuid) -> Result<()> {
        self.set_status(photo_id, PhotoStatus::Failed).await
    }

    async fn mark_completed(&self, photo_id: Uuid, derived: &DerivedAsset) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE photos
            SET status = 'completed',
                thumb_key = $2,
                preview_key = $3,
                width = $4,
                height = $5,
                blur_hash = $6,
                exif = $7,
                file_size = $8,
                mime_type = $9,
                captured_at = $10,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(photo_id)
        .bind(&derived.thumb_key)
        .bind(&derived.preview_key)
        .bind(derived.width as i32)
        .bind(derived.height as i32)
        .bind(&derived.blur_hash)
        .bind(&derived.exif)
        .bind(derived.file_size)
        .bind(&derived.mime_type)
        .bind(derived.captured_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
