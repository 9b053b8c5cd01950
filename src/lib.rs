pub mod batch_manager;
pub mod config;
pub mod delay_manager;
pub mod extractor;
pub mod fetcher;
pub mod file_sink;
pub mod link_source;
pub mod logger;
pub mod resume_manager;
pub mod retry;

// Exporting types for convenience
pub use batch_manager::{BatchManager, BatchReport, BatchSettings, DownloadOutcome};
pub use config::Config;
pub use extractor::{ExtractionResult, Extractor};
pub use fetcher::{Fetch, HttpFetcher};
pub use file_sink::FileSink;
pub use link_source::{Item, LinkSource};
pub use resume_manager::{ProgressState, ProgressStore};
