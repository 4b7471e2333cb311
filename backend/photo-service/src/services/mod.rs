pub mod dispatcher;
pub mod packager;
pub mod processor;
pub mod ssrf;
pub mod watermark;

pub use dispatcher::ProcessPhotoHandler;
pub use packager::{ArchivePhoto, ArchiveRequest, ArchiveSummary, PackageCreator};
pub use processor::{ImageProcessor, ProcessOutput};
pub use watermark::{LogoFetcher, WatermarkCompositor};
