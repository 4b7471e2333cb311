//! Album archive packager
//!
//! Assembles a ZIP of album contents: originals under `无水印/` and
//! watermarked variants under `有水印/`. The watermarked variant
//! prefers the precomputed preview object; if the preview is missing it
//! is regenerated from the original, and if the album has watermarking
//! disabled the original bytes pass through unmodified. Photo payloads
//! are prepared with bounded concurrency while the ZIP stream itself is
//! written sequentially in input order. One bad photo skips that photo,
//! never the archive; only a ZIP-stream error aborts.

use crate::db::AlbumStore;
use crate::error::{AppError, Result};
use crate::services::processor::ImageProcessor;
use crate::services::watermark::LogoFetcher;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::io::{Seek, Write};
use std::sync::Arc;
use storage_adapter::{StorageAdapter, StorageError};
use tracing::{info, warn};
use uuid::Uuid;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const FOLDER_CLEAN: &str = "无水印";
pub const FOLDER_WATERMARKED: &str = "有水印";

/// One photo to include in an archive.
#[derive(Debug, Clone)]
pub struct ArchivePhoto {
    /// Display name inside the archive, typically the upload filename.
    pub file_name: String,
    pub album_id: Uuid,
    pub original_key: String,
    /// Precomputed watermarked preview, when processing has completed.
    pub preview_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ArchiveRequest {
    pub photos: Vec<ArchivePhoto>,
    pub include_original: bool,
    pub include_watermarked: bool,
}

/// What actually went into the archive.
#[derive(Debug, Default)]
pub struct ArchiveSummary {
    /// Photos fully packed.
    pub packed: usize,
    /// File names of photos that failed and were skipped.
    pub skipped: Vec<String>,
}

/// Per-photo payloads ready for the writer.
struct PackedPhoto {
    file_name: String,
    original: Option<Bytes>,
    watermarked: Option<Bytes>,
}

pub struct PackageCreator {
    storage: Arc<dyn StorageAdapter>,
    albums: Arc<dyn AlbumStore>,
    processor: Arc<ImageProcessor>,
    logo_fetcher: Arc<LogoFetcher>,
    concurrency: usize,
}

impl PackageCreator {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        albums: Arc<dyn AlbumStore>,
        processor: Arc<ImageProcessor>,
        logo_fetcher: Arc<LogoFetcher>,
        concurrency: usize,
    ) -> Self {
        Self {
            storage,
            albums,
            processor,
            logo_fetcher,
            concurrency: concurrency.max(1),
        }
    }

    /// Build the archive into `writer`. Entries appear in input order,
    /// with the clean variant first for each photo. Returns the
    /// pack/skip summary; the call fails only on writer or ZIP-format
    /// errors, or on an invalid request.
    pub async fn create_archive<W: Write + Seek>(
        &self,
        request: &ArchiveRequest,
        writer: W,
    ) -> Result<ArchiveSummary> {
        if request.photos.is_empty() {
            return Err(AppError::Validation(
                "archive request contains no photos".to_string(),
            ));
        }
        if !request.include_original && !request.include_watermarked {
            return Err(AppError::Validation(
                "archive request selects no variant".to_string(),
            ));
        }

        // `buffered` keeps input order while up to `concurrency`
        // photos are prepared ahead of the writer.
        let mut prepared = futures::stream::iter(request.photos.iter().map(|photo| {
            let photo = photo.clone();
            async move {
                match self.prepare_photo(&photo, request).await {
                    Ok(packed) => Ok(packed),
                    Err(e) => {
                        warn!(
                            file_name = %photo.file_name,
                            original_key = %photo.original_key,
                            error = %e,
                            "Photo skipped from archive"
                        );
                        Err(photo.file_name)
                    }
                }
            }
        }))
        .buffered(self.concurrency);

        let mut zip = ZipWriter::new(writer);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut names = NameAllocator::default();
        let mut summary = ArchiveSummary::default();

        while let Some(result) = prepared.next().await {
            match result {
                Ok(packed) => {
                    if let Some(bytes) = &packed.original {
                        append_entry(
                            &mut zip,
                            options,
                            FOLDER_CLEAN,
                            &names.allocate(FOLDER_CLEAN, &packed.file_name),
                            bytes,
                        )?;
                    }
                    if let Some(bytes) = &packed.watermarked {
                        append_entry(
                            &mut zip,
                            options,
                            FOLDER_WATERMARKED,
                            &names.allocate(FOLDER_WATERMARKED, &packed.file_name),
                            bytes,
                        )?;
                    }
                    summary.packed += 1;
                }
                Err(file_name) => summary.skipped.push(file_name),
            }
        }

        zip.finish()
            .map_err(|e| AppError::Processing(format!("ZIP finalize failed: {e}")))?;

        info!(
            packed = summary.packed,
            skipped = summary.skipped.len(),
            "Archive assembled"
        );
        Ok(summary)
    }

    async fn prepare_photo(
        &self,
        photo: &ArchivePhoto,
        request: &ArchiveRequest,
    ) -> Result<PackedPhoto> {
        let original = self.storage.download(&photo.original_key).await?;

        let watermarked = if request.include_watermarked {
            Some(self.watermarked_bytes(photo, &original).await?)
        } else {
            None
        };

        Ok(PackedPhoto {
            file_name: photo.file_name.clone(),
            original: request.include_original.then(|| original),
            watermarked,
        })
    }

    /// Watermarked variant: precomputed preview when available, else
    /// regenerated from the original; unmodified original when the
    /// album has watermarking off.
    async fn watermarked_bytes(&self, photo: &ArchivePhoto, original: &Bytes) -> Result<Bytes> {
        let watermark = self.albums.watermark_config(photo.album_id).await?;
        if !watermark.enabled {
            return Ok(original.clone());
        }

        if let Some(preview_key) = &photo.preview_key {
            match self.storage.download(preview_key).await {
                Ok(bytes) => return Ok(bytes),
                Err(StorageError::NotFound(_)) => {
                    warn!(preview_key = %preview_key, "Preview object missing, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let logos = self.logo_fetcher.prefetch(&watermark).await?;
        let output = self
            .processor
            .process(original.clone(), watermark, logos)
            .await?;
        Ok(Bytes::from(output.preview))
    }
}

fn append_entry<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    options: FileOptions,
    folder: &str,
    name: &str,
    bytes: &Bytes,
) -> Result<()> {
    zip.start_file(format!("{folder}/{name}"), options)
        .map_err(|e| AppError::Processing(format!("ZIP entry failed: {e}")))?;
    zip.write_all(bytes)
        .map_err(|e| AppError::Processing(format!("ZIP write failed: {e}")))?;
    Ok(())
}

/// Per-folder filename dedup: the second `photo.jpg` becomes
/// `photo (1).jpg`.
#[derive(Default)]
struct NameAllocator {
    seen: HashMap<String, u32>,
}

impl NameAllocator {
    fn allocate(&mut self, folder: &str, file_name: &str) -> String {
        let scoped = format!("{folder}/{file_name}");
        let count = self.seen.entry(scoped).or_insert(0);
        *count += 1;
        if *count == 1 {
            return file_name.to_string();
        }
        let suffix = *count - 1;
        match file_name.rsplit_once('.') {
            Some((stem, ext)) => format!("{stem} ({suffix}).{ext}"),
            None => format!("{file_name} ({suffix})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessorConfig;
    use crate::models::{LayerKind, WatermarkConfig, WatermarkLayer, WatermarkPosition};
    use async_trait::async_trait;
    use image::codecs::jpeg::JpegEncoder;
    use image::DynamicImage;
    use std::io::Cursor;
    use std::time::Duration;
    use storage_adapter::{MemoryAdapter, ObjectMeta};

    struct FixedAlbumStore(WatermarkConfig);

    #[async_trait]
    impl AlbumStore for FixedAlbumStore {
        async fn watermark_config(&self, _album_id: Uuid) -> Result<WatermarkConfig> {
            Ok(self.0.clone())
        }
    }

    fn jpeg_fixture(width: u32, height: u32) -> Bytes {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 32])
        }));
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut Cursor::new(&mut buf), 90)
            .encode_image(&img)
            .unwrap();
        Bytes::from(buf)
    }

    fn text_watermark() -> WatermarkConfig {
        WatermarkConfig {
            enabled: true,
            layers: vec![WatermarkLayer {
                kind: LayerKind::Text,
                content: "© studio".to_string(),
                opacity: 0.5,
                position: WatermarkPosition::BottomRight,
                enabled: true,
            }],
            legacy_single: false,
        }
    }

    fn creator(storage: Arc<MemoryAdapter>, watermark: WatermarkConfig) -> PackageCreator {
        let processor = Arc::new(ImageProcessor::for_tests(ProcessorConfig {
            thumb_max_edge: 100,
            thumb_quality: 80,
            preview_max_edge: 400,
            preview_quality: 90,
            watermark_font_path: "/nonexistent/font.ttf".to_string(),
            logo_fetch_timeout_secs: 1,
            logo_max_bytes: 1024,
        }));
        PackageCreator::new(
            storage,
            Arc::new(FixedAlbumStore(watermark)),
            processor,
            Arc::new(LogoFetcher::new(Duration::from_secs(1), 1024).unwrap()),
            4,
        )
    }

    fn read_entries(buf: Vec<u8>) -> Vec<(String, Vec<u8>)> {
        let mut archive = zip::ZipArchive::new(Cursor::new(buf)).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut file = archive.by_index(i).unwrap();
                let mut body = Vec::new();
                std::io::Read::read_to_end(&mut file, &mut body).unwrap();
                (file.name().to_string(), body)
            })
            .collect()
    }

    fn photo(file_name: &str, original_key: &str, preview_key: Option<&str>) -> ArchivePhoto {
        ArchivePhoto {
            file_name: file_name.to_string(),
            album_id: Uuid::new_v4(),
            original_key: original_key.to_string(),
            preview_key: preview_key.map(|k| k.to_string()),
        }
    }

    #[tokio::test]
    async fn test_both_variants_use_precomputed_preview() {
        let storage = Arc::new(MemoryAdapter::new());
        storage
            .upload("originals/a.jpg", jpeg_fixture(200, 150), ObjectMeta::default())
            .await
            .unwrap();
        storage
            .upload(
                "previews/a.jpg",
                Bytes::from_static(b"precomputed-preview"),
                ObjectMeta::default(),
            )
            .await
            .unwrap();

        let request = ArchiveRequest {
            photos: vec![photo("sunset.jpg", "originals/a.jpg", Some("previews/a.jpg"))],
            include_original: true,
            include_watermarked: true,
        };

        let mut buf = Cursor::new(Vec::new());
        let summary = creator(storage, text_watermark())
            .create_archive(&request, &mut buf)
            .await
            .unwrap();
        assert_eq!(summary.packed, 1);

        let entries = read_entries(buf.into_inner());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "无水印/sunset.jpg");
        assert_eq!(entries[1].0, "有水印/sunset.jpg");
        assert_eq!(entries[1].1, b"precomputed-preview");
    }

    #[tokio::test]
    async fn test_watermark_off_passthrough_is_byte_identical() {
        let storage = Arc::new(MemoryAdapter::new());
        let original = jpeg_fixture(200, 150);
        storage
            .upload("originals/a.jpg", original.clone(), ObjectMeta::default())
            .await
            .unwrap();

        let request = ArchiveRequest {
            photos: vec![photo("a.jpg", "originals/a.jpg", None)],
            include_original: true,
            include_watermarked: true,
        };

        let mut buf = Cursor::new(Vec::new());
        creator(storage, WatermarkConfig::default())
            .create_archive(&request, &mut buf)
            .await
            .unwrap();

        let entries = read_entries(buf.into_inner());
        let clean = &entries.iter().find(|(n, _)| n.starts_with("无水印")).unwrap().1;
        let marked = &entries.iter().find(|(n, _)| n.starts_with("有水印")).unwrap().1;
        assert_eq!(clean, &original.to_vec());
        assert_eq!(marked, &original.to_vec());
    }

    #[tokio::test]
    async fn test_missing_preview_regenerates_from_original() {
        let storage = Arc::new(MemoryAdapter::new());
        storage
            .upload("originals/a.jpg", jpeg_fixture(600, 400), ObjectMeta::default())
            .await
            .unwrap();

        // preview_key points at an object that no longer exists
        let request = ArchiveRequest {
            photos: vec![photo("a.jpg", "originals/a.jpg", Some("previews/gone.jpg"))],
            include_original: false,
            include_watermarked: true,
        };

        let mut buf = Cursor::new(Vec::new());
        let summary = creator(storage, text_watermark())
            .create_archive(&request, &mut buf)
            .await
            .unwrap();
        assert_eq!(summary.packed, 1);

        let entries = read_entries(buf.into_inner());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "有水印/a.jpg");
        // Regenerated preview fits the configured max edge
        let img = image::load_from_memory(&entries[0].1).unwrap();
        let (w, h) = (img.width(), img.height());
        assert_eq!(w.max(h), 400);
    }

    #[tokio::test]
    async fn test_bad_photo_skipped_archive_still_finalizes() {
        let storage = Arc::new(MemoryAdapter::new());
        for i in 0..9 {
            storage
                .upload(
                    &format!("originals/{i}.jpg"),
                    jpeg_fixture(50, 50),
                    ObjectMeta::default(),
                )
                .await
                .unwrap();
        }

        // 10 photos, one original absent from storage
        let photos: Vec<ArchivePhoto> = (0..10)
            .map(|i| photo(&format!("photo-{i}.jpg"), &format!("originals/{i}.jpg"), None))
            .collect();
        let request = ArchiveRequest {
            photos,
            include_original: true,
            include_watermarked: false,
        };

        let mut buf = Cursor::new(Vec::new());
        let summary = creator(storage, WatermarkConfig::default())
            .create_archive(&request, &mut buf)
            .await
            .unwrap();

        assert_eq!(summary.packed, 9);
        assert_eq!(summary.skipped, vec!["photo-9.jpg".to_string()]);
        assert_eq!(read_entries(buf.into_inner()).len(), 9);
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected_up_front() {
        let storage = Arc::new(MemoryAdapter::new());
        let creator = creator(storage, WatermarkConfig::default());

        let mut buf = Cursor::new(Vec::new());
        let empty = ArchiveRequest {
            photos: vec![],
            include_original: true,
            include_watermarked: true,
        };
        assert!(matches!(
            creator.create_archive(&empty, &mut buf).await,
            Err(AppError::Validation(_))
        ));

        let no_variant = ArchiveRequest {
            photos: vec![photo("a.jpg", "originals/a.jpg", None)],
            include_original: false,
            include_watermarked: false,
        };
        assert!(matches!(
            creator.create_archive(&no_variant, &mut buf).await,
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_duplicate_names_get_numeric_suffix() {
        let mut names = NameAllocator::default();
        assert_eq!(names.allocate("无水印", "photo.jpg"), "photo.jpg");
        assert_eq!(names.allocate("无水印", "photo.jpg"), "photo (1).jpg");
        assert_eq!(names.allocate("无水印", "photo.jpg"), "photo (2).jpg");
        // Same name in the other folder is not a collision
        assert_eq!(names.allocate("有水印", "photo.jpg"), "photo.jpg");
        // Extensionless names still get a suffix
        assert_eq!(names.allocate("无水印", "README"), "README");
        assert_eq!(names.allocate("无水印", "README"), "README (1)");
    }
}
