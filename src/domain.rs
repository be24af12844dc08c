//! Domain module - Core entities and value objects of the crawler
//!
//! This module contains the listing entity, crawl progress records,
//! the shared counters and the field normalizers. Nothing in here
//! performs I/O.

pub mod checkpoint;
pub mod listing;
pub mod listing_url;
pub mod metrics;
pub mod normalize;
pub mod run_stats;

// Re-export commonly used items for convenience
pub use checkpoint::{Checkpoint, CrawlCounters};
pub use listing::{BadgeFlags, Listing};
pub use listing_url::{ListingCandidate, extract_listing_id};
pub use metrics::{CrawlMetrics, FailureCategory};
pub use run_stats::{FailureBreakdown, RunOutcome, RunStats};
