//! HTTP fetching for crawling with rate limiting and error handling
//!
//! [`RateLimitedFetcher`] is the only component that talks to the network.
//! It bounds the number of requests in flight, spaces requests out, rotates
//! through proxy endpoints when the site starts refusing an IP, and retries
//! according to [`RetryPolicy`].

use anyhow::Context;
use async_trait::async_trait;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, direct::NotKeyed},
};
use reqwest::{
    Client, StatusCode,
    cookie::Jar,
    header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, REFERER},
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{CrawlMetrics, FailureCategory};
use crate::infrastructure::config::PipelineConfig;
use crate::infrastructure::proxy_pool::{ProxyEndpoint, ProxyPool};
use crate::infrastructure::retry_policy::{AttemptFailure, RetryPolicy, RetryState};

const DOCUMENT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const XHR_ACCEPT: &str = "application/json, text/javascript, */*; q=0.01";
const ACCEPT_LANGUAGES: &str = "az,en-US;q=0.9,en;q=0.8,ru;q=0.7";

/// What kind of resource is being requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Regular HTML page load
    Document,
    /// Background JSON call made by page scripts
    Xhr {
        referer: String,
        csrf_token: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub kind: RequestKind,
}

impl FetchRequest {
    pub fn document(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: RequestKind::Document,
        }
    }

    pub fn xhr(url: impl Into<String>, referer: impl Into<String>, csrf_token: Option<String>) -> Self {
        Self {
            url: url.into(),
            kind: RequestKind::Xhr {
                referer: referer.into(),
                csrf_token,
            },
        }
    }
}

/// A successful (2xx) response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub body: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Blocked with HTTP {status} after {attempts} attempt(s): {url}")]
    Blocked { url: String, status: u16, attempts: u32 },

    #[error("Timed out after {attempts} attempt(s): {url}")]
    Timeout { url: String, attempts: u32 },

    #[error("Transport error after {attempts} attempt(s) for {url}: {message}")]
    Transport {
        url: String,
        message: String,
        attempts: u32,
    },

    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Request cancelled: {url}")]
    Cancelled { url: String },
}

impl FetchError {
    /// Counter bucket for this failure; cancellation is not a failure
    pub fn category(&self) -> Option<FailureCategory> {
        match self {
            Self::Blocked { .. } => Some(FailureCategory::Blocked),
            Self::Timeout { .. } => Some(FailureCategory::Timeout),
            Self::Transport { .. } => Some(FailureCategory::Transport),
            Self::Status { .. } => Some(FailureCategory::HttpStatus),
            Self::Cancelled { .. } => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Source of pages for the crawler
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchedPage, FetchError>;
}

/// Map a non-success status to a retry decision
pub fn classify_status(status: StatusCode) -> AttemptFailure {
    match status {
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => AttemptFailure::Blocked,
        StatusCode::REQUEST_TIMEOUT => AttemptFailure::Timeout,
        s if s.is_server_error() => AttemptFailure::ServerError,
        _ => AttemptFailure::Permanent,
    }
}

/// Result of one attempt that did not produce a page
#[derive(Debug)]
enum AttemptError {
    Failed {
        failure: AttemptFailure,
        status: Option<u16>,
        message: String,
    },
    Cancelled,
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Concurrency-bounded, paced, proxy-rotating HTTP fetcher
pub struct RateLimitedFetcher {
    /// One client per proxy endpoint, same order as the pool
    clients: Vec<Client>,
    pool: ProxyPool,
    permits: Semaphore,
    request_delay: Duration,
    limiter: Option<DirectLimiter>,
    policy: RetryPolicy,
    metrics: Arc<CrawlMetrics>,
    cancel: CancellationToken,
}

impl RateLimitedFetcher {
    pub fn new(
        config: &PipelineConfig,
        metrics: Arc<CrawlMetrics>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let pool = ProxyPool::from_urls(&config.proxy_urls);

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(ACCEPT_LANGUAGES));

        // One session across all endpoints
        let jar = Arc::new(Jar::default());

        let clients = pool
            .endpoints()
            .iter()
            .map(|endpoint| {
                let mut builder = Client::builder()
                    .timeout(config.request_timeout())
                    .connect_timeout(config.request_timeout())
                    .user_agent(config.user_agent())
                    .default_headers(headers.clone())
                    .cookie_provider(Arc::clone(&jar))
                    .gzip(true)
                    .brotli(true)
                    .redirect(reqwest::redirect::Policy::limited(10));
                builder = match endpoint {
                    ProxyEndpoint::Direct => builder.no_proxy(),
                    ProxyEndpoint::Proxy(url) => builder.proxy(
                        reqwest::Proxy::all(url)
                            .with_context(|| format!("Invalid proxy {}", endpoint.label()))?,
                    ),
                };
                builder
                    .build()
                    .with_context(|| format!("Failed to create HTTP client for {}", endpoint.label()))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let limiter = config
            .max_requests_per_second
            .and_then(NonZeroU32::new)
            .map(|rps| RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            clients,
            pool,
            permits: Semaphore::new(config.concurrency),
            request_delay: config.request_delay(),
            limiter,
            policy: RetryPolicy::from_config(config),
            metrics,
            cancel,
        })
    }

    /// Replace the retry policy derived from configuration
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn attempt_once(
        &self,
        request: &FetchRequest,
        endpoint: usize,
    ) -> Result<FetchedPage, AttemptError> {
        let _permit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(AttemptError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| AttemptError::Cancelled)?,
        };

        // Pacing is per permit holder, so `concurrency` slots each keep the delay
        if !self.request_delay.is_zero() {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(AttemptError::Cancelled),
                () = tokio::time::sleep(self.request_delay) => {}
            }
        }
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let mut builder = self.clients[endpoint].get(&request.url);
        builder = match &request.kind {
            RequestKind::Document => builder.header(ACCEPT, DOCUMENT_ACCEPT),
            RequestKind::Xhr {
                referer,
                csrf_token,
            } => {
                let builder = builder
                    .header(ACCEPT, XHR_ACCEPT)
                    .header("X-Requested-With", "XMLHttpRequest")
                    .header(REFERER, referer.as_str());
                match csrf_token {
                    Some(token) => builder.header("X-CSRF-Token", token.as_str()),
                    None => builder,
                }
            }
        };

        debug!("GET {} via {}", request.url, self.pool.endpoints()[endpoint].label());
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                self.metrics.record_request(0);
                return Err(transport_failure(&e));
            }
        };

        let status = response.status();
        let body = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.metrics.record_request(0);
                return Err(transport_failure(&e));
            }
        };
        self.metrics.record_request(body.len() as u64);

        if !status.is_success() {
            return Err(AttemptError::Failed {
                failure: classify_status(status),
                status: Some(status.as_u16()),
                message: format!("HTTP {status}"),
            });
        }

        Ok(FetchedPage {
            url: request.url.clone(),
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

fn transport_failure(error: &reqwest::Error) -> AttemptError {
    let failure = if error.is_timeout() {
        AttemptFailure::Timeout
    } else {
        AttemptFailure::Transport
    };
    AttemptError::Failed {
        failure,
        status: None,
        message: error.to_string(),
    }
}

fn give_up_error(
    url: &str,
    attempts: u32,
    failure: AttemptFailure,
    status: Option<u16>,
    message: String,
) -> FetchError {
    let url = url.to_string();
    match (failure, status) {
        (AttemptFailure::Blocked, Some(status)) => FetchError::Blocked {
            url,
            status,
            attempts,
        },
        (AttemptFailure::Timeout, _) => FetchError::Timeout { url, attempts },
        (AttemptFailure::Transport, _) => FetchError::Transport {
            url,
            message,
            attempts,
        },
        (_, Some(status)) => FetchError::Status { url, status },
        (_, None) => FetchError::Transport {
            url,
            message,
            attempts,
        },
    }
}

#[async_trait]
impl PageFetcher for RateLimitedFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchedPage, FetchError> {
        let mut state = RetryState::start();
        let mut endpoint = self.pool.current();
        let mut last_status = None;
        let mut last_message = String::new();

        loop {
            match state {
                RetryState::Attempt(attempt) => match self.attempt_once(&request, endpoint).await {
                    Ok(page) => return Ok(page),
                    Err(AttemptError::Cancelled) => {
                        return Err(FetchError::Cancelled { url: request.url });
                    }
                    Err(AttemptError::Failed {
                        failure,
                        status,
                        message,
                    }) => {
                        warn!(
                            "Attempt {}/{} failed for {} via {}: {}",
                            attempt,
                            self.policy.max_attempts,
                            request.url,
                            self.pool.endpoints()[endpoint].label(),
                            message
                        );
                        last_status = status;
                        last_message = message;
                        state = state.on_failure(&self.policy, failure);
                    }
                },
                RetryState::Backoff {
                    delay,
                    rotate_proxy,
                    ..
                } => {
                    if rotate_proxy {
                        endpoint = self.pool.rotate_from(endpoint);
                    }
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => {
                            return Err(FetchError::Cancelled { url: request.url });
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                    state = state.resume();
                }
                RetryState::GiveUp {
                    attempts,
                    last_failure,
                } => {
                    return Err(give_up_error(
                        &request.url,
                        attempts,
                        last_failure,
                        last_status,
                        last_message,
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::Config;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Local HTTP server answering from a canned list
    struct TestServer {
        addr: SocketAddr,
        hits: Arc<AtomicUsize>,
        peak_in_flight: Arc<AtomicUsize>,
        arrivals: Arc<Mutex<Vec<Instant>>>,
    }

    impl TestServer {
        fn url(&self) -> String {
            format!("http://{}/autos", self.addr)
        }

        fn proxy_url(&self) -> String {
            format!("http://{}", self.addr)
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    /// Serve the given (status, body) responses in order, then repeat the
    /// last one. Each connection is held open for `hold` before answering.
    async fn serve_with(responses: Vec<(u16, &'static str)>, hold: Duration) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = TestServer {
            addr: listener.local_addr().unwrap(),
            hits: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            arrivals: Arc::new(Mutex::new(Vec::new())),
        };
        let hits = Arc::clone(&server.hits);
        let peak = Arc::clone(&server.peak_in_flight);
        let arrivals = Arc::clone(&server.arrivals);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let responses = Arc::new(responses);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                arrivals.lock().unwrap().push(Instant::now());
                let n = hits.fetch_add(1, Ordering::SeqCst);
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);

                let responses = Arc::clone(&responses);
                let in_flight = Arc::clone(&in_flight);
                tokio::spawn(async move {
                    let (status, body) = responses[n.min(responses.len() - 1)];
                    let mut buf = vec![0_u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    tokio::time::sleep(hold).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    let reply = format!(
                        "HTTP/1.1 {status} X\r\nContent-Length: {}\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(reply.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        server
    }

    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
        let server = serve_with(responses, Duration::ZERO).await;
        (server.url(), server.hits)
    }

    fn config_with(
        base_url: &str,
        proxies: Vec<String>,
        concurrency: i64,
        request_delay_ms: i64,
    ) -> PipelineConfig {
        let settings = Config::builder()
            .set_override("start_page", 1_i64)
            .unwrap()
            .set_override("end_page", 1_i64)
            .unwrap()
            .set_override("base_url", base_url)
            .unwrap()
            .set_override("concurrency", concurrency)
            .unwrap()
            .set_override("request_delay_ms", request_delay_ms)
            .unwrap()
            .set_override("checkpoint_interval", 10_i64)
            .unwrap()
            .set_override("proxy_urls", proxies)
            .unwrap()
            .set_override("database_url", "sqlite::memory:")
            .unwrap()
            .set_override("request_timeout_secs", 5_i64)
            .unwrap()
            .build()
            .unwrap();
        PipelineConfig::from_settings(settings).unwrap()
    }

    fn config_for(base_url: &str) -> PipelineConfig {
        config_with(base_url, vec!["direct".to_string()], 2, 0)
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            jitter: false,
        }
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::FORBIDDEN), AttemptFailure::Blocked);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), AttemptFailure::Blocked);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), AttemptFailure::ServerError);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), AttemptFailure::Permanent);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), AttemptFailure::Permanent);
    }

    #[test]
    fn give_up_maps_to_error_kinds() {
        let err = give_up_error("u", 3, AttemptFailure::Blocked, Some(429), String::new());
        assert_eq!(err.category(), Some(FailureCategory::Blocked));
        let err = give_up_error("u", 3, AttemptFailure::ServerError, Some(503), String::new());
        assert!(matches!(err, FetchError::Status { status: 503, .. }));
        let err = give_up_error("u", 2, AttemptFailure::Timeout, None, String::new());
        assert!(matches!(err, FetchError::Timeout { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn server_error_is_retried_then_succeeds() {
        let (url, hits) = serve(vec![(503, "busy"), (200, "<html>ok</html>")]).await;
        let metrics = Arc::new(CrawlMetrics::new());
        let fetcher = RateLimitedFetcher::new(
            &config_for(&url),
            Arc::clone(&metrics),
            CancellationToken::new(),
        )
        .unwrap()
        .with_retry_policy(fast_policy());

        let page = fetcher.fetch(FetchRequest::document(&url)).await.unwrap();
        assert_eq!(page.status, 200);
        assert!(page.body.contains("ok"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        // both attempts are counted, including the failed one
        assert_eq!(metrics.requests_issued(), 2);
        assert_eq!(metrics.snapshot().bytes_received, ("busy".len() + "<html>ok</html>".len()) as u64);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let (url, hits) = serve(vec![(404, "missing")]).await;
        let fetcher = RateLimitedFetcher::new(
            &config_for(&url),
            Arc::new(CrawlMetrics::new()),
            CancellationToken::new(),
        )
        .unwrap()
        .with_retry_policy(fast_policy());

        let err = fetcher.fetch(FetchRequest::document(&url)).await.unwrap_err();
        assert_eq!(err, FetchError::Status { url, status: 404 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persistent_blocking_surfaces_blocked() {
        let (url, hits) = serve(vec![(429, "slow down")]).await;
        let fetcher = RateLimitedFetcher::new(
            &config_for(&url),
            Arc::new(CrawlMetrics::new()),
            CancellationToken::new(),
        )
        .unwrap()
        .with_retry_policy(fast_policy());

        let err = fetcher.fetch(FetchRequest::document(&url)).await.unwrap_err();
        assert!(matches!(err, FetchError::Blocked { status: 429, attempts: 3, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_sending() {
        let (url, hits) = serve(vec![(200, "ok")]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let fetcher =
            RateLimitedFetcher::new(&config_for(&url), Arc::new(CrawlMetrics::new()), cancel)
                .unwrap();

        let err = fetcher.fetch(FetchRequest::document(&url)).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn in_flight_requests_stay_within_concurrency() {
        let hold = Duration::from_millis(100);
        let server = serve_with(vec![(200, "ok")], hold).await;
        let url = server.url();
        let fetcher = RateLimitedFetcher::new(
            &config_with(&url, vec!["direct".to_string()], 2, 0),
            Arc::new(CrawlMetrics::new()),
            CancellationToken::new(),
        )
        .unwrap();

        let started = Instant::now();
        let results = futures::future::join_all(
            (0..6).map(|_| fetcher.fetch(FetchRequest::document(url.clone()))),
        )
        .await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(server.hits(), 6);
        assert!(server.peak_in_flight.load(Ordering::SeqCst) <= 2);
        // six requests, two at a time
        assert!(started.elapsed() >= hold * 3);
    }

    #[tokio::test]
    async fn request_delay_spaces_out_requests() {
        let delay = Duration::from_millis(60);
        let server = serve_with(vec![(200, "ok")], Duration::ZERO).await;
        let url = server.url();
        let fetcher = RateLimitedFetcher::new(
            &config_with(&url, vec!["direct".to_string()], 1, 60),
            Arc::new(CrawlMetrics::new()),
            CancellationToken::new(),
        )
        .unwrap();

        for _ in 0..3 {
            fetcher.fetch(FetchRequest::document(url.clone())).await.unwrap();
        }

        let arrivals = server.arrivals.lock().unwrap().clone();
        assert_eq!(arrivals.len(), 3);
        for pair in arrivals.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= delay);
        }
    }

    #[tokio::test]
    async fn blocked_endpoint_rotates_to_next_proxy() {
        let blocked = serve_with(vec![(429, "slow down")], Duration::ZERO).await;
        let healthy = serve_with(vec![(200, "<html>via second</html>")], Duration::ZERO).await;
        let target = "http://listings.test/autos";
        let fetcher = RateLimitedFetcher::new(
            &config_with(target, vec![blocked.proxy_url(), healthy.proxy_url()], 2, 0),
            Arc::new(CrawlMetrics::new()),
            CancellationToken::new(),
        )
        .unwrap()
        .with_retry_policy(fast_policy());

        let page = fetcher.fetch(FetchRequest::document(target)).await.unwrap();

        assert!(page.body.contains("via second"));
        assert_eq!(blocked.hits(), 1);
        assert_eq!(healthy.hits(), 1);
        assert_eq!(fetcher.pool.current(), 1);
    }
}
