//! Detail page scraping with the phone reveal follow-up

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use url::Url;

use crate::domain::{CrawlMetrics, FailureCategory, Listing, ListingCandidate};
use crate::infrastructure::parsing::parse_phone_response;
use crate::infrastructure::{FetchError, FetchRequest, ListingDetailParser, PageFetcher};

/// URL of the XHR endpoint that reveals a listing's phone numbers
pub fn phone_reveal_url(candidate: &ListingCandidate) -> Option<String> {
    let mut url = Url::parse(&candidate.url).ok()?;
    url.set_path(&format!("/autos/{}/show_phones", candidate.listing_id));
    url.set_fragment(None);
    url.set_query(None);
    url.query_pairs_mut()
        .append_pair("trigger_button", "main")
        .append_pair("source_link", &candidate.url);
    Some(url.to_string())
}

pub struct DetailExtractor {
    fetcher: Arc<dyn PageFetcher>,
    parser: ListingDetailParser,
    metrics: Arc<CrawlMetrics>,
}

impl DetailExtractor {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        parser: ListingDetailParser,
        metrics: Arc<CrawlMetrics>,
    ) -> Self {
        Self {
            fetcher,
            parser,
            metrics,
        }
    }

    /// Fetch and parse one listing.
    ///
    /// Only the detail page itself can fail the listing; a failed phone
    /// reveal leaves `seller_phones` unknown.
    pub async fn extract(&self, candidate: &ListingCandidate) -> Result<Listing, FetchError> {
        let page = self
            .fetcher
            .fetch(FetchRequest::document(candidate.url.clone()))
            .await?;

        let detail = self.parser.parse(&page.body, candidate, Utc::now());
        if !detail.is_complete() {
            debug!("{} is missing {:?}", candidate, detail.missing_fields);
            self.metrics.record_failure(FailureCategory::ParseMismatch);
        }

        let mut listing = detail.listing;
        listing.seller_phones = self.reveal_phones(candidate, detail.csrf_token).await;
        self.metrics
            .record_phone_result(listing.seller_phones.is_some());
        Ok(listing)
    }

    async fn reveal_phones(
        &self,
        candidate: &ListingCandidate,
        csrf_token: Option<String>,
    ) -> Option<Vec<String>> {
        let url = phone_reveal_url(candidate)?;
        let request = FetchRequest::xhr(url, candidate.url.clone(), csrf_token);

        match self.fetcher.fetch(request).await {
            Ok(response) => match parse_phone_response(&response.body) {
                Ok(phones) => Some(phones),
                Err(e) => {
                    warn!("Phone reveal for {} returned unreadable data: {}", candidate.listing_id, e);
                    None
                }
            },
            Err(e) => {
                warn!("Phone reveal for {} failed: {}", candidate.listing_id, e);
                None
            }
        }
    }
}
