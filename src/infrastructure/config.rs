//! Configuration infrastructure
//!
//! Settings are layered with the `config` crate: an optional TOML file first,
//! then `CRAWLER_*` environment variables on top. Nested sections use a double
//! underscore (`CRAWLER_LOGGING__LEVEL=debug`). `proxy_urls` is read from the
//! environment as a comma separated list.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Marker value for `proxy_urls` that disables proxying
pub const DIRECT_CONNECTION: &str = "direct";

/// Default values for optional settings
pub mod defaults {
    pub const CHECKPOINT_PATH: &str = "crawl_checkpoint.json";
    pub const REQUEST_TIMEOUT_SECS: u64 = 30;
    pub const MAX_RETRIES: u32 = 3;
    pub const BACKOFF_BASE_MS: u64 = 1_000;
    pub const BACKOFF_MAX_MS: u64 = 30_000;
    pub const PROMOTED_COUNT: usize = 12;
    /// About $0.09 per 11.5 MB of proxy traffic
    pub const COST_PER_GB_USD: f64 = 8.0;
    pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
        (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_JSON_FORMAT: bool = false;
    pub const LOG_CONSOLE_OUTPUT: bool = true;
    pub const LOG_FILE_OUTPUT: bool = false;
    pub const LOG_DIRECTORY: &str = "logs";
    pub const LOG_FILE_NAME: &str = "autos-crawler.log";
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {source}")]
    Load {
        #[from]
        source: config::ConfigError,
    },

    #[error("Configuration validation failed: {message}")]
    Validation { message: String },
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Everything one crawl run needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// First index page, inclusive
    pub start_page: u32,
    /// Last index page, inclusive
    pub end_page: u32,
    /// Listing index URL; page N>1 is requested as `?page=N`
    pub base_url: String,
    /// Maximum number of requests in flight
    pub concurrency: usize,
    /// Pause before every request, per worker slot
    pub request_delay_ms: u64,
    /// Listings to buffer before a flush is due
    pub checkpoint_interval: usize,
    /// Proxy endpoints in rotation order, or `["direct"]`
    pub proxy_urls: Vec<String>,
    pub database_url: String,

    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Global ceiling across all workers, unlimited when absent
    #[serde(default)]
    pub max_requests_per_second: Option<u32>,
    /// Size of the pinned block at the top of each index page
    #[serde(default = "default_promoted_count")]
    pub promoted_count: usize,
    #[serde(default = "default_cost_per_gb_usd")]
    pub cost_per_gb_usd: f64,
    /// Run summaries are POSTed here as JSON when set
    #[serde(default)]
    pub notify_webhook_url: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from(defaults::CHECKPOINT_PATH)
}

fn default_request_timeout_secs() -> u64 {
    defaults::REQUEST_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    defaults::MAX_RETRIES
}

fn default_backoff_base_ms() -> u64 {
    defaults::BACKOFF_BASE_MS
}

fn default_backoff_max_ms() -> u64 {
    defaults::BACKOFF_MAX_MS
}

fn default_promoted_count() -> usize {
    defaults::PROMOTED_COUNT
}

fn default_cost_per_gb_usd() -> f64 {
    defaults::COST_PER_GB_USD
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,
    /// Enable JSON formatted logs
    pub json_format: bool,
    pub console_output: bool,
    pub file_output: bool,
    pub directory: PathBuf,
    pub file_name: String,
    /// Per-target overrides, e.g. `sqlx = "warn"`
    pub module_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: defaults::LOG_JSON_FORMAT,
            console_output: defaults::LOG_CONSOLE_OUTPUT,
            file_output: defaults::LOG_FILE_OUTPUT,
            directory: PathBuf::from(defaults::LOG_DIRECTORY),
            file_name: defaults::LOG_FILE_NAME.to_string(),
            module_filters: HashMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Load from an optional file plus the environment, then validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let settings = Self::builder(path).build()?;
        Self::from_settings(settings)
    }

    /// Source stack used by [`load`](Self::load); callers may add overrides
    pub fn builder(path: Option<&Path>) -> ConfigBuilder<DefaultState> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder.add_source(
            Environment::with_prefix("CRAWLER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("proxy_urls"),
        )
    }

    pub fn from_settings(settings: Config) -> Result<Self, ConfigError> {
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_page == 0 {
            return Err(ConfigError::invalid("start_page must be at least 1"));
        }
        if self.end_page < self.start_page {
            return Err(ConfigError::invalid(format!(
                "end_page ({}) must not be before start_page ({})",
                self.end_page, self.start_page
            )));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::invalid("concurrency must be greater than 0"));
        }
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::invalid("checkpoint_interval must be greater than 0"));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::invalid("request_timeout_secs must be greater than 0"));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(ConfigError::invalid(
                "backoff_base_ms cannot be greater than backoff_max_ms",
            ));
        }
        if self.max_requests_per_second == Some(0) {
            return Err(ConfigError::invalid(
                "max_requests_per_second must be greater than 0 when set",
            ));
        }
        if !self.cost_per_gb_usd.is_finite() || self.cost_per_gb_usd < 0.0 {
            return Err(ConfigError::invalid("cost_per_gb_usd must be a non-negative number"));
        }
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::invalid("database_url is required"));
        }

        let base = Url::parse(&self.base_url)
            .map_err(|e| ConfigError::invalid(format!("base_url is not a valid URL: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::invalid("base_url must be http or https"));
        }

        if self.proxy_urls.is_empty() {
            return Err(ConfigError::invalid(format!(
                "proxy_urls is required; use \"{DIRECT_CONNECTION}\" to crawl without a proxy"
            )));
        }
        for proxy in self.proxy_urls.iter().filter(|p| !is_direct(p)) {
            Url::parse(proxy.trim()).map_err(|e| {
                ConfigError::invalid(format!("proxy URL {} is invalid: {e}", mask_proxy(proxy)))
            })?;
        }
        if self.uses_direct_connection() && self.proxy_urls.len() > 1 {
            return Err(ConfigError::invalid(format!(
                "\"{DIRECT_CONNECTION}\" cannot be mixed with proxy URLs"
            )));
        }

        if let Some(hook) = &self.notify_webhook_url {
            Url::parse(hook)
                .map_err(|e| ConfigError::invalid(format!("notify_webhook_url is invalid: {e}")))?;
        }

        Ok(())
    }

    /// True when proxying is explicitly disabled
    pub fn uses_direct_connection(&self) -> bool {
        self.proxy_urls.iter().any(|p| is_direct(p))
    }

    /// URL of one index page
    pub fn index_page_url(&self, page: u32) -> String {
        if page <= 1 {
            return self.base_url.clone();
        }
        let separator = if self.base_url.contains('?') { '&' } else { '?' };
        format!("{}{}page={}", self.base_url, separator, page)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn user_agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or(defaults::USER_AGENT)
    }
}

fn is_direct(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case(DIRECT_CONNECTION)
}

/// Hide credentials in a proxy URL before it is logged
pub fn mask_proxy(proxy: &str) -> String {
    match Url::parse(proxy.trim()) {
        Ok(mut url) if !url.username().is_empty() || url.password().is_some() => {
            let _ = url.set_username("***");
            let _ = url.set_password(None);
            url.to_string()
        }
        Ok(url) => url.to_string(),
        Err(_) => "<unparseable proxy>".to_string(),
    }
}
