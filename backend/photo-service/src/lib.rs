//! Photo Service
//!
//! Asynchronous photo-processing pipeline: a Redis-backed job queue
//! feeds workers that derive thumbnails, watermarked previews, BlurHash
//! placeholders and EXIF metadata from uploaded originals, plus an
//! album archive packager. Storage backends are pluggable through the
//! `storage-adapter` crate.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod queue;
pub mod services;

// Public re-exports
pub use config::Config;
pub use error::{AppError, Result};
