//! Shared crawl counters
//!
//! Workers, the fetcher and the persister all report into one
//! [`CrawlMetrics`] behind an `Arc`. Every field is an independent atomic, so
//! recording never blocks and never needs a lock.

use std::sync::atomic::{AtomicU64, Ordering};

use super::checkpoint::CrawlCounters;

/// Why a listing or page could not be scraped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    /// 403/429 after every proxy rotation
    Blocked,
    Timeout,
    /// Connection reset, DNS, proxy tunnel failure
    Transport,
    /// Non-retryable HTTP status (404, 401 ...)
    HttpStatus,
    /// Page did not have the expected shape
    ParseMismatch,
}

#[derive(Debug, Default)]
pub struct CrawlMetrics {
    pages_processed: AtomicU64,
    pages_failed: AtomicU64,
    listings_succeeded: AtomicU64,
    listings_failed: AtomicU64,
    phone_succeeded: AtomicU64,
    phone_failed: AtomicU64,
    inserted: AtomicU64,
    updated: AtomicU64,
    duplicates_skipped: AtomicU64,
    url_conflicts: AtomicU64,
    requests_issued: AtomicU64,
    bytes_received: AtomicU64,
    blocked: AtomicU64,
    timeouts: AtomicU64,
    transport_errors: AtomicU64,
    http_errors: AtomicU64,
    parse_mismatches: AtomicU64,
    promoted_excluded: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl CrawlMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue counting from a checkpoint
    pub fn from_counters(counters: &CrawlCounters) -> Self {
        Self {
            pages_processed: AtomicU64::new(counters.pages_processed),
            pages_failed: AtomicU64::new(counters.pages_failed),
            listings_succeeded: AtomicU64::new(counters.listings_succeeded),
            listings_failed: AtomicU64::new(counters.listings_failed),
            phone_succeeded: AtomicU64::new(counters.phone_succeeded),
            phone_failed: AtomicU64::new(counters.phone_failed),
            inserted: AtomicU64::new(counters.inserted),
            updated: AtomicU64::new(counters.updated),
            duplicates_skipped: AtomicU64::new(counters.duplicates_skipped),
            url_conflicts: AtomicU64::new(counters.url_conflicts),
            requests_issued: AtomicU64::new(counters.requests_issued),
            bytes_received: AtomicU64::new(counters.bytes_received),
            blocked: AtomicU64::new(counters.blocked),
            timeouts: AtomicU64::new(counters.timeouts),
            transport_errors: AtomicU64::new(counters.transport_errors),
            http_errors: AtomicU64::new(counters.http_errors),
            parse_mismatches: AtomicU64::new(counters.parse_mismatches),
            promoted_excluded: AtomicU64::new(counters.promoted_excluded),
        }
    }

    /// Called for every HTTP attempt, successful or not
    pub fn record_request(&self, bytes: u64) {
        bump(&self.requests_issued, 1);
        bump(&self.bytes_received, bytes);
    }

    pub fn record_failure(&self, category: FailureCategory) {
        let counter = match category {
            FailureCategory::Blocked => &self.blocked,
            FailureCategory::Timeout => &self.timeouts,
            FailureCategory::Transport => &self.transport_errors,
            FailureCategory::HttpStatus => &self.http_errors,
            FailureCategory::ParseMismatch => &self.parse_mismatches,
        };
        bump(counter, 1);
    }

    pub fn record_listing_success(&self) {
        bump(&self.listings_succeeded, 1);
    }

    pub fn record_listing_failure(&self, category: FailureCategory) {
        bump(&self.listings_failed, 1);
        self.record_failure(category);
    }

    pub fn record_phone_result(&self, success: bool) {
        if success {
            bump(&self.phone_succeeded, 1);
        } else {
            bump(&self.phone_failed, 1);
        }
    }

    pub fn record_page(&self, success: bool) {
        if success {
            bump(&self.pages_processed, 1);
        } else {
            bump(&self.pages_failed, 1);
        }
    }

    pub fn record_duplicates(&self, count: u64) {
        bump(&self.duplicates_skipped, count);
    }

    pub fn record_promoted_excluded(&self, count: u64) {
        bump(&self.promoted_excluded, count);
    }

    /// Fold the result of one persisted batch into the totals
    pub fn record_persisted(&self, inserted: u64, updated: u64, url_conflicts: u64) {
        bump(&self.inserted, inserted);
        bump(&self.updated, updated);
        bump(&self.url_conflicts, url_conflicts);
    }

    pub fn requests_issued(&self) -> u64 {
        read(&self.requests_issued)
    }

    pub fn snapshot(&self) -> CrawlCounters {
        CrawlCounters {
            pages_processed: read(&self.pages_processed),
            pages_failed: read(&self.pages_failed),
            listings_succeeded: read(&self.listings_succeeded),
            listings_failed: read(&self.listings_failed),
            phone_succeeded: read(&self.phone_succeeded),
            phone_failed: read(&self.phone_failed),
            inserted: read(&self.inserted),
            updated: read(&self.updated),
            duplicates_skipped: read(&self.duplicates_skipped),
            url_conflicts: read(&self.url_conflicts),
            requests_issued: read(&self.requests_issued),
            bytes_received: read(&self.bytes_received),
            blocked: read(&self.blocked),
            timeouts: read(&self.timeouts),
            transport_errors: read(&self.transport_errors),
            http_errors: read(&self.http_errors),
            parse_mismatches: read(&self.parse_mismatches),
            promoted_excluded: read(&self.promoted_excluded),
        }
    }
}
