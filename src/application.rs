//! Application layer - crawl orchestration
//!
//! Wires the fetcher, parsers, store and checkpoint file into one crawl run
//! and turns its outcome into a report.

pub mod checkpoint_manager;
pub mod crawl_pipeline;
pub mod detail_extractor;
pub mod error;
pub mod run_reporter;

// Re-export commonly used items
pub use checkpoint_manager::{CheckpointManager, FlushState};
pub use crawl_pipeline::{CrawlPipeline, CrawlSummary, PromotedBlockMonitor};
pub use detail_extractor::{DetailExtractor, phone_reveal_url};
pub use error::PipelineError;
pub use run_reporter::RunReporter;
