use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cumulative counters carried from checkpoint to checkpoint.
///
/// A resumed run seeds its [`CrawlMetrics`](super::CrawlMetrics) from these,
/// so the numbers reported at the end cover the whole page range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlCounters {
    pub pages_processed: u64,
    pub pages_failed: u64,
    pub listings_succeeded: u64,
    pub listings_failed: u64,
    pub phone_succeeded: u64,
    pub phone_failed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub duplicates_skipped: u64,
    pub url_conflicts: u64,
    pub requests_issued: u64,
    pub bytes_received: u64,
    pub blocked: u64,
    pub timeouts: u64,
    pub transport_errors: u64,
    pub http_errors: u64,
    pub parse_mismatches: u64,
    pub promoted_excluded: u64,
}

impl CrawlCounters {
    /// Share of attempted listing scrapes that produced a record
    pub fn success_rate(&self) -> f64 {
        ratio(self.listings_succeeded, self.listings_succeeded + self.listings_failed)
    }

    /// Share of phone reveal calls that returned a list
    pub fn phone_success_rate(&self) -> f64 {
        ratio(self.phone_succeeded, self.phone_succeeded + self.phone_failed)
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 { 0.0 } else { part as f64 / whole as f64 }
}

/// Durable crawl progress.
///
/// `last_completed_page` only ever names a page whose listings were all
/// persisted before this record was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// 0 when no page of the range has completed yet
    pub last_completed_page: u32,
    pub start_page: u32,
    pub end_page: u32,
    pub counters: CrawlCounters,
    /// Index pages that could not be fetched or parsed
    #[serde(default)]
    pub failed_pages: Vec<u32>,
    /// Set once the whole range has been walked
    #[serde(default)]
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Fresh checkpoint for a page range, before any page completed
    pub fn new(start_page: u32, end_page: u32) -> Self {
        Self {
            last_completed_page: start_page.saturating_sub(1),
            start_page,
            end_page,
            counters: CrawlCounters::default(),
            failed_pages: Vec::new(),
            completed: false,
            updated_at: Utc::now(),
        }
    }

    /// Page to continue from
    pub fn resume_page(&self) -> u32 {
        self.last_completed_page.max(self.start_page.saturating_sub(1)) + 1
    }

    /// Whether this checkpoint belongs to the given range and still has work left
    pub fn is_resumable_for(&self, start_page: u32, end_page: u32) -> bool {
        !self.completed
            && self.start_page == start_page
            && self.end_page == end_page
            && self.resume_page() <= end_page
    }
}
