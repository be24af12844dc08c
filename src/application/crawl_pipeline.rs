//! Page-by-page crawl orchestration
//!
//! Index pages are walked in order. The listings of one page are scraped by a
//! bounded pool of concurrent futures, handed to the [`CheckpointManager`] at
//! the page boundary, and only then does the crawl move to the next page.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::checkpoint_manager::CheckpointManager;
use super::detail_extractor::DetailExtractor;
use super::error::PipelineError;
use crate::domain::{CrawlCounters, CrawlMetrics, FailureCategory, Listing, ListingCandidate, RunOutcome};
use crate::infrastructure::{
    FetchRequest, IndexPage, ListingDetailParser, ListingIndexParser, PageFetcher, PipelineConfig,
};

/// Minimum share of pinned ids expected to repeat between consecutive pages
const PROMOTED_OVERLAP_THRESHOLD: f64 = 0.5;

/// Watches the pinned block for signs that the page layout changed.
///
/// The same paid listings are pinned on every index page, so the excluded ids
/// of consecutive pages should mostly coincide.
#[derive(Debug, Default)]
pub struct PromotedBlockMonitor {
    previous: Option<HashSet<i64>>,
}

impl PromotedBlockMonitor {
    /// Returns the overlap with the previous page, when there is one to compare
    pub fn observe(&mut self, page: u32, excluded_ids: &[i64]) -> Option<f64> {
        let current: HashSet<i64> = excluded_ids.iter().copied().collect();
        let overlap = match &self.previous {
            Some(previous) if !previous.is_empty() && !current.is_empty() => {
                let shared = previous.intersection(&current).count();
                Some(shared as f64 / previous.len().max(current.len()) as f64)
            }
            _ => None,
        };
        if let Some(ratio) = overlap {
            if ratio < PROMOTED_OVERLAP_THRESHOLD {
                warn!(
                    "Pinned block on page {} overlaps the previous page by only {:.0}%; \
                     promoted_count may no longer match the layout",
                    page,
                    ratio * 100.0
                );
            }
        }
        if !current.is_empty() {
            self.previous = Some(current);
        }
        overlap
    }
}

/// What a finished run hands to the reporter
#[derive(Debug, Clone)]
pub struct CrawlSummary {
    pub start_page: u32,
    pub end_page: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub counters: CrawlCounters,
    /// Counters inherited from the checkpoint this run resumed
    pub baseline: CrawlCounters,
    pub failed_pages: Vec<u32>,
}

enum ListingResult {
    Scraped(Listing),
    Failed,
    /// Not started or aborted because of shutdown
    Skipped,
}

enum PageOutcome {
    Done(Vec<Listing>),
    Failed,
    /// Shutdown arrived while the page was in progress
    Interrupted(Vec<Listing>),
}

pub struct CrawlPipeline {
    config: PipelineConfig,
    fetcher: Arc<dyn PageFetcher>,
    index_parser: ListingIndexParser,
    extractor: DetailExtractor,
    checkpoints: CheckpointManager,
    metrics: Arc<CrawlMetrics>,
    cancel: CancellationToken,
    seen: Mutex<HashSet<i64>>,
    monitor: PromotedBlockMonitor,
}

impl CrawlPipeline {
    pub fn new(
        config: &PipelineConfig,
        fetcher: Arc<dyn PageFetcher>,
        checkpoints: CheckpointManager,
        metrics: Arc<CrawlMetrics>,
        cancel: CancellationToken,
    ) -> Result<Self, PipelineError> {
        let index_parser = ListingIndexParser::new(&config.base_url, config.promoted_count)?;
        let extractor = DetailExtractor::new(
            Arc::clone(&fetcher),
            ListingDetailParser::new()?,
            Arc::clone(&metrics),
        );

        Ok(Self {
            config: config.clone(),
            fetcher,
            index_parser,
            extractor,
            checkpoints,
            metrics,
            cancel,
            seen: Mutex::new(HashSet::new()),
            monitor: PromotedBlockMonitor::default(),
        })
    }

    /// Crawl from the checkpoint's resume page to the end of the range.
    ///
    /// Never returns an error: fatal problems end the run with
    /// [`RunOutcome::Failed`] after a best-effort flush.
    pub async fn run(mut self) -> CrawlSummary {
        let started_at = Utc::now();
        let baseline = self.checkpoints.checkpoint().counters;
        let first_page = self.checkpoints.resume_page();

        info!(
            "Crawling pages {}-{} (starting at {}) with {} workers",
            self.config.start_page, self.config.end_page, first_page, self.config.concurrency
        );

        let outcome = match self.walk(first_page).await {
            Ok(completed) => self.finish(completed).await,
            Err(e) => {
                error!("Crawl aborted: {}", e);
                if let Err(flush_error) = self.checkpoints.finish(false).await {
                    error!("Final flush after failure also failed: {}", flush_error);
                }
                RunOutcome::Failed {
                    error: e.to_string(),
                    resume_page: self.checkpoints.resume_page(),
                }
            }
        };

        CrawlSummary {
            start_page: self.config.start_page,
            end_page: self.config.end_page,
            started_at,
            finished_at: Utc::now(),
            outcome,
            counters: self.metrics.snapshot(),
            baseline,
            failed_pages: self.checkpoints.failed_pages(),
        }
    }

    /// Returns whether the whole range was walked
    async fn walk(&mut self, first_page: u32) -> Result<bool, PipelineError> {
        for page in first_page..=self.config.end_page {
            if self.cancel.is_cancelled() {
                info!("Shutdown requested before page {}", page);
                return Ok(false);
            }

            match self.crawl_page(page).await {
                PageOutcome::Done(listings) => {
                    self.metrics.record_page(true);
                    info!("Page {} done: {} listings", page, listings.len());
                    self.checkpoints.complete_page(page, listings, false).await?;
                }
                PageOutcome::Failed => {
                    self.metrics.record_page(false);
                    self.checkpoints.complete_page(page, Vec::new(), true).await?;
                }
                PageOutcome::Interrupted(listings) => {
                    info!("Shutdown during page {}, keeping {} finished listings", page, listings.len());
                    self.checkpoints.add_partial(listings);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn finish(&mut self, completed: bool) -> RunOutcome {
        match self.checkpoints.finish(completed).await {
            Ok(_) if completed => RunOutcome::Completed,
            Ok(_) => RunOutcome::Interrupted {
                resume_page: self.checkpoints.resume_page(),
            },
            Err(e) => {
                error!("Final flush failed: {}", e);
                RunOutcome::Failed {
                    error: e.to_string(),
                    resume_page: self.checkpoints.resume_page(),
                }
            }
        }
    }

    async fn crawl_page(&mut self, page: u32) -> PageOutcome {
        let Some(index) = self.fetch_index(page).await else {
            return if self.cancel.is_cancelled() {
                PageOutcome::Interrupted(Vec::new())
            } else {
                PageOutcome::Failed
            };
        };

        self.metrics.record_promoted_excluded(index.excluded.len() as u64);
        for _ in 0..index.mismatches {
            self.metrics.record_failure(FailureCategory::ParseMismatch);
        }
        if index.filtered {
            self.monitor.observe(page, &index.excluded_ids());
        }

        let candidates = self.unseen(index.items).await;
        let this = &*self;
        let results: Vec<ListingResult> = stream::iter(candidates)
            .map(|candidate| this.scrape_listing(candidate))
            .buffered(this.config.concurrency.max(1))
            .collect()
            .await;

        let mut listings = Vec::with_capacity(results.len());
        let mut skipped = false;
        for result in results {
            match result {
                ListingResult::Scraped(listing) => listings.push(listing),
                ListingResult::Failed => {}
                ListingResult::Skipped => skipped = true,
            }
        }

        if skipped {
            PageOutcome::Interrupted(listings)
        } else {
            PageOutcome::Done(listings)
        }
    }

    /// `None` when the page could not be fetched
    async fn fetch_index(&self, page: u32) -> Option<IndexPage> {
        let url = self.config.index_page_url(page);
        let body = match self.fetcher.fetch(FetchRequest::document(url)).await {
            Ok(response) => response.body,
            Err(e) => {
                if let Some(category) = e.category() {
                    warn!("Index page {} failed: {}", page, e);
                    self.metrics.record_failure(category);
                }
                return None;
            }
        };

        Some(self.index_parser.parse(&body, page))
    }

    /// Drop listings already scraped earlier in this run
    async fn unseen(&self, items: Vec<ListingCandidate>) -> Vec<ListingCandidate> {
        let mut seen = self.seen.lock().await;
        let total = items.len();
        let fresh: Vec<_> = items
            .into_iter()
            .filter(|candidate| seen.insert(candidate.listing_id))
            .collect();
        let repeated = (total - fresh.len()) as u64;
        if repeated > 0 {
            info!("Skipping {} listings already scraped in this run", repeated);
            self.metrics.record_duplicates(repeated);
        }
        fresh
    }

    async fn scrape_listing(&self, candidate: ListingCandidate) -> ListingResult {
        if self.cancel.is_cancelled() {
            self.seen.lock().await.remove(&candidate.listing_id);
            return ListingResult::Skipped;
        }

        match self.extractor.extract(&candidate).await {
            Ok(listing) => {
                self.metrics.record_listing_success();
                ListingResult::Scraped(listing)
            }
            Err(e) => {
                self.seen.lock().await.remove(&candidate.listing_id);
                match e.category() {
                    Some(category) => {
                        warn!("{} failed: {}", candidate, e);
                        self.metrics.record_listing_failure(category);
                        ListingResult::Failed
                    }
                    None => ListingResult::Skipped,
                }
            }
        }
    }
}
