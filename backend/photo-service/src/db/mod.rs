//! Record-store collaborators
//!
//! The relational store is external to this core; these repositories
//! only read/update the field subsets the pipeline touches, one atomic
//! row write per status update. Traits sit at the seam so tests
//! substitute in-memory fakes for the Postgres implementations.

pub mod album_repo;
pub mod photo_repo;

pub use album_repo::{AlbumStore, PgAlbumStore};
pub use photo_repo::{PgPhotoStore, PhotoStore};
