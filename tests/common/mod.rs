//! Shared fixtures: an in-memory site behind the `PageFetcher` seam

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use config::Config;
use tokio_util::sync::CancellationToken;
use url::Url;

use autos_crawler::application::{CheckpointManager, CrawlPipeline, CrawlSummary};
use autos_crawler::domain::CrawlMetrics;
use autos_crawler::infrastructure::{
    CheckpointStore, DatabaseConnection, FetchError, FetchRequest, FetchedPage, ListingRepository,
    ListingSink, PageFetcher, PipelineConfig,
};

pub const BASE_URL: &str = "https://turbo.az/autos";

/// Listing ids pinned on every page
pub const PINNED_ID_BASE: i64 = 9_000_000;

/// Id of the regular listing at `position` on `page`
pub fn listing_id(page: u32, position: usize) -> i64 {
    i64::from(page) * 1000 + position as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneMode {
    Reveal,
    Refuse(u16),
    Garbage,
}

/// Fake turbo.az: index pages open with `pinned` promoted cards followed by
/// `per_page` regular ones.
pub struct FakeSite {
    pub pinned: usize,
    pub per_page: usize,
    pub phone_mode: PhoneMode,
    pub panic_on_listing: Option<i64>,
    pub failing_pages: HashSet<u32>,
    /// Pages served without any listing card
    pub empty_pages: HashSet<u32>,
    /// Extra listing ids appended to a page, after the regular ones
    pub extra_cards: Vec<(u32, i64)>,
    /// Cancel this token once the given number of detail pages was served
    pub cancel_after_details: Option<(usize, CancellationToken)>,
    pub requests: Mutex<Vec<String>>,
    pub detail_fetches: AtomicUsize,
}

impl FakeSite {
    pub fn new(pinned: usize, per_page: usize) -> Self {
        Self {
            pinned,
            per_page,
            phone_mode: PhoneMode::Reveal,
            panic_on_listing: None,
            failing_pages: HashSet::new(),
            empty_pages: HashSet::new(),
            extra_cards: Vec::new(),
            cancel_after_details: None,
            requests: Mutex::new(Vec::new()),
            detail_fetches: AtomicUsize::new(0),
        }
    }

    pub fn requested(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Index pages requested, in order
    pub fn index_pages_requested(&self) -> Vec<u32> {
        self.requested()
            .iter()
            .filter_map(|u| {
                let url = Url::parse(u).unwrap();
                if url.path() != "/autos" {
                    return None;
                }
                Some(
                    url.query_pairs()
                        .find(|(k, _)| k == "page")
                        .map_or(1, |(_, v)| v.parse().unwrap()),
                )
            })
            .collect()
    }

    fn index_html(&self, page: u32) -> String {
        let mut cards = String::new();
        if self.empty_pages.contains(&page) {
            return r#"<html><body><div class="products"></div></body></html>"#.to_string();
        }
        for i in 0..self.pinned {
            cards.push_str(&card(
                PINNED_ID_BASE + i as i64,
                r#"<div class="products-i__label products-i__label--vip"></div>"#,
            ));
        }
        for position in self.pinned..self.pinned + self.per_page {
            cards.push_str(&card(listing_id(page, position), ""));
        }
        for (_, id) in self.extra_cards.iter().filter(|(p, _)| *p == page) {
            cards.push_str(&card(*id, ""));
        }
        format!(r#"<html><body><div class="products">{cards}</div></body></html>"#)
    }

    fn detail_html(id: i64) -> String {
        format!(
            r#"<html><head><meta name="csrf-token" content="csrf-{id}"></head><body>
            <h1 class="product-title">Hyundai Elantra {id}</h1>
            <div class="product-price__i product-price__i--bold">{price} AZN</div>
            <div class="product-properties__i"><label class="product-properties__i-name">Marka</label>
              <span class="product-properties__i-value">Hyundai</span></div>
            <div class="product-properties__i"><label class="product-properties__i-name">Yürüş</label>
              <span class="product-properties__i-value">{id} km</span></div>
            </body></html>"#,
            price = 10_000 + id
        )
    }

    fn phone_body(&self, id: i64) -> Result<String, FetchError> {
        match self.phone_mode {
            PhoneMode::Reveal => Ok(format!(
                r#"{{"phones":[{{"primary":"(050) 555-{:04}","raw":"050555{:04}"}}]}}"#,
                id % 10_000,
                id % 10_000
            )),
            PhoneMode::Garbage => Ok("<html>Access denied</html>".to_string()),
            PhoneMode::Refuse(status) => Err(FetchError::Blocked {
                url: format!("{BASE_URL}/{id}/show_phones"),
                status,
                attempts: 3,
            }),
        }
    }
}

fn card(id: i64, extra: &str) -> String {
    format!(
        r#"<div class="products-i">{extra}<a class="products-i__link" href="/autos/{id}-hyundai-elantra"></a></div>"#
    )
}

fn ok(url: String, body: String) -> Result<FetchedPage, FetchError> {
    Ok(FetchedPage {
        url,
        status: 200,
        body,
    })
}

#[async_trait]
impl PageFetcher for FakeSite {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchedPage, FetchError> {
        self.requests.lock().unwrap().push(request.url.clone());
        let url = Url::parse(&request.url).unwrap();
        let segments: Vec<&str> = url.path_segments().unwrap().collect();

        match segments.as_slice() {
            ["autos"] => {
                let page = url
                    .query_pairs()
                    .find(|(k, _)| k == "page")
                    .map_or(1, |(_, v)| v.parse().unwrap());
                if self.failing_pages.contains(&page) {
                    return Err(FetchError::Status {
                        url: request.url,
                        status: 404,
                    });
                }
                let body = self.index_html(page);
                ok(request.url, body)
            }
            ["autos", id, "show_phones"] => {
                let id: i64 = id.parse().unwrap();
                let body = self.phone_body(id)?;
                ok(request.url, body)
            }
            ["autos", slug] => {
                let id: i64 = slug.split('-').next().unwrap().parse().unwrap();
                if self.panic_on_listing == Some(id) {
                    panic!("simulated crash while scraping listing {id}");
                }
                let served = self.detail_fetches.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some((limit, token)) = &self.cancel_after_details {
                    if served >= *limit {
                        token.cancel();
                    }
                }
                ok(request.url, Self::detail_html(id))
            }
            _ => Err(FetchError::Status {
                url: request.url,
                status: 404,
            }),
        }
    }
}

pub fn test_config(
    dir: &Path,
    start_page: u32,
    end_page: u32,
    promoted_count: usize,
    checkpoint_interval: usize,
) -> PipelineConfig {
    let settings = Config::builder()
        .set_override("start_page", i64::from(start_page))
        .unwrap()
        .set_override("end_page", i64::from(end_page))
        .unwrap()
        .set_override("base_url", BASE_URL)
        .unwrap()
        .set_override("concurrency", 2_i64)
        .unwrap()
        .set_override("request_delay_ms", 0_i64)
        .unwrap()
        .set_override("checkpoint_interval", checkpoint_interval as i64)
        .unwrap()
        .set_override("proxy_urls", vec!["direct"])
        .unwrap()
        .set_override(
            "database_url",
            format!("sqlite:{}", dir.join("listings.db").display()),
        )
        .unwrap()
        .set_override(
            "checkpoint_path",
            dir.join("checkpoint.json").display().to_string(),
        )
        .unwrap()
        .set_override("promoted_count", promoted_count as i64)
        .unwrap()
        .build()
        .unwrap();
    PipelineConfig::from_settings(settings).unwrap()
}

pub async fn open_repository(config: &PipelineConfig) -> ListingRepository {
    let db = DatabaseConnection::new(&config.database_url).await.unwrap();
    db.migrate().await.unwrap();
    ListingRepository::new(db.pool().clone())
}

/// Wire a pipeline the way the binary does, with `site` as the network
pub async fn run_pipeline(
    config: PipelineConfig,
    site: Arc<FakeSite>,
    cancel: CancellationToken,
) -> CrawlSummary {
    let repository = open_repository(&config).await;
    let store = CheckpointStore::new(&config.checkpoint_path);
    let checkpoint =
        CheckpointManager::load_or_fresh(&store, config.start_page, config.end_page).await;
    let metrics = Arc::new(CrawlMetrics::from_counters(&checkpoint.counters));

    let sink: Arc<dyn ListingSink> = Arc::new(repository);
    let checkpoints = CheckpointManager::new(
        store,
        sink,
        Arc::clone(&metrics),
        checkpoint,
        config.checkpoint_interval,
    );
    let fetcher: Arc<dyn PageFetcher> = site;
    CrawlPipeline::new(&config, fetcher, checkpoints, metrics, cancel)
        .unwrap()
        .run()
        .await
}
