//! Run summary delivery

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::domain::RunStats;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives one summary per run
#[async_trait]
pub trait RunNotifier: Send + Sync {
    async fn notify(&self, stats: &RunStats) -> Result<()>;
}

/// Writes the summary to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl RunNotifier for LogNotifier {
    async fn notify(&self, stats: &RunStats) -> Result<()> {
        if stats.is_success() {
            info!("{}", stats.headline());
        } else {
            warn!("{}", stats.headline());
        }
        info!(
            "Failures: {} blocked, {} timeouts, {} transport, {} http status, {} parse mismatches",
            stats.failures.blocked,
            stats.failures.timeout,
            stats.failures.transport,
            stats.failures.http_status,
            stats.failures.parse_mismatch
        );
        if !stats.failed_pages.is_empty() {
            warn!("Failed index pages: {:?}", stats.failed_pages);
        }
        Ok(())
    }
}

/// POSTs the summary as JSON
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .context("Failed to build webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RunNotifier for WebhookNotifier {
    async fn notify(&self, stats: &RunStats) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(stats)
            .send()
            .await
            .with_context(|| format!("Webhook request to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("Webhook {} answered {}", self.url, status);
        }
        info!("Run summary delivered to webhook");
        Ok(())
    }
}

/// Webhook when a URL is configured, log otherwise
pub fn notifier_for(webhook_url: Option<&str>) -> Result<Box<dyn RunNotifier>> {
    match webhook_url {
        Some(url) => Ok(Box::new(WebhookNotifier::new(url)?)),
        None => Ok(Box::new(LogNotifier)),
    }
}
