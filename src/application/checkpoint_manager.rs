//! Batch buffering and durable progress
//!
//! Listings collected from finished pages are buffered until at least
//! `checkpoint_interval` of them are waiting, then flushed: the batch is
//! persisted and, only once that succeeded, the checkpoint moves forward to
//! the last page whose listings are now stored.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::error::PipelineError;
use crate::domain::{Checkpoint, CrawlMetrics, Listing};
use crate::infrastructure::{CheckpointStore, ListingSink, PersistResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    /// Nothing buffered since the last flush
    Idle,
    Accumulating,
    Flushing,
}

pub struct CheckpointManager {
    store: CheckpointStore,
    sink: Arc<dyn ListingSink>,
    metrics: Arc<CrawlMetrics>,
    interval: usize,
    /// Last record written to disk
    checkpoint: Checkpoint,
    batch: Vec<Listing>,
    /// Highest fully processed page not yet covered by `checkpoint`
    pending_page: Option<u32>,
    pending_failed: Vec<u32>,
    state: FlushState,
}

impl CheckpointManager {
    /// Checkpoint to continue from, or a fresh one for the range.
    ///
    /// A completed run, a different page range or an unreadable file all
    /// start over from `start_page`.
    pub async fn load_or_fresh(store: &CheckpointStore, start_page: u32, end_page: u32) -> Checkpoint {
        match store.load().await {
            Ok(Some(checkpoint)) if checkpoint.is_resumable_for(start_page, end_page) => {
                info!(
                    "Resuming pages {}-{} at page {} from {}",
                    start_page,
                    end_page,
                    checkpoint.resume_page(),
                    store.path().display()
                );
                checkpoint
            }
            Ok(Some(checkpoint)) => {
                info!(
                    "Checkpoint for pages {}-{} (completed: {}) does not apply, starting fresh",
                    checkpoint.start_page, checkpoint.end_page, checkpoint.completed
                );
                Checkpoint::new(start_page, end_page)
            }
            Ok(None) => Checkpoint::new(start_page, end_page),
            Err(e) => {
                warn!("Ignoring unreadable checkpoint: {}", e);
                Checkpoint::new(start_page, end_page)
            }
        }
    }

    pub fn new(
        store: CheckpointStore,
        sink: Arc<dyn ListingSink>,
        metrics: Arc<CrawlMetrics>,
        checkpoint: Checkpoint,
        interval: usize,
    ) -> Self {
        Self {
            store,
            sink,
            metrics,
            interval: interval.max(1),
            checkpoint,
            batch: Vec::new(),
            pending_page: None,
            pending_failed: Vec::new(),
            state: FlushState::Idle,
        }
    }

    pub fn state(&self) -> FlushState {
        self.state
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn buffered(&self) -> usize {
        self.batch.len()
    }

    /// First page not yet durably covered
    pub fn resume_page(&self) -> u32 {
        self.checkpoint.resume_page()
    }

    /// Failed pages, durable and pending
    pub fn failed_pages(&self) -> Vec<u32> {
        let mut pages = self.checkpoint.failed_pages.clone();
        pages.extend(&self.pending_failed);
        pages
    }

    /// Buffer listings without marking their page as done
    pub fn add_partial(&mut self, listings: Vec<Listing>) {
        if !listings.is_empty() {
            self.batch.extend(listings);
            self.state = FlushState::Accumulating;
        }
    }

    /// Record a finished page and flush when enough listings are waiting
    pub async fn complete_page(
        &mut self,
        page: u32,
        listings: Vec<Listing>,
        failed: bool,
    ) -> Result<Option<PersistResult>, PipelineError> {
        self.batch.extend(listings);
        self.pending_page = Some(page);
        if failed {
            self.pending_failed.push(page);
        }
        self.state = FlushState::Accumulating;

        if self.batch.len() >= self.interval {
            return self.flush(false).await.map(Some);
        }
        debug!("Page {} buffered, {} listings waiting", page, self.batch.len());
        Ok(None)
    }

    /// Flush whatever is buffered; always writes a checkpoint on success
    pub async fn finish(&mut self, completed: bool) -> Result<PersistResult, PipelineError> {
        self.flush(completed).await
    }

    async fn flush(&mut self, completed: bool) -> Result<PersistResult, PipelineError> {
        self.state = FlushState::Flushing;

        let result = if self.batch.is_empty() {
            PersistResult::default()
        } else {
            let result = self.sink.persist(&self.batch).await;
            if let Some(message) = result.error.clone() {
                self.state = FlushState::Accumulating;
                return Err(PipelineError::Persist {
                    batch: self.batch.len(),
                    message,
                });
            }
            self.metrics
                .record_persisted(result.inserted, result.updated, result.skipped);
            self.metrics.record_duplicates(result.deduplicated);
            self.batch.clear();
            result
        };

        let mut next = self.checkpoint.clone();
        if let Some(page) = self.pending_page {
            next.last_completed_page = page;
        }
        next.failed_pages.extend(&self.pending_failed);
        next.completed = completed;
        next.counters = self.metrics.snapshot();
        next.updated_at = Utc::now();

        self.store.save(&next).await?;
        self.checkpoint = next;
        self.pending_page = None;
        self.pending_failed.clear();
        self.state = FlushState::Idle;

        info!(
            "Flushed {} listings, checkpoint at page {}",
            result.durable(),
            self.checkpoint.last_completed_page
        );
        Ok(result)
    }
}
