//! Infrastructure layer for HTTP, parsing, storage and external integrations
//!
//! Everything that touches the network, the file system or the database
//! lives here. The application layer drives these through the
//! [`PageFetcher`], [`ListingSink`] and [`RunNotifier`] seams.

pub mod checkpoint_store;
pub mod config;
pub mod database_connection;
pub mod http_client;
pub mod listing_repository;
pub mod logging;
pub mod notifier;
pub mod parsing;
pub mod proxy_pool;
pub mod retry_policy;

// Re-export commonly used items
pub use checkpoint_store::{CheckpointError, CheckpointStore};
pub use config::{ConfigError, LoggingConfig, PipelineConfig};
pub use database_connection::DatabaseConnection;
pub use http_client::{
    FetchError, FetchRequest, FetchedPage, PageFetcher, RateLimitedFetcher, RequestKind,
};
pub use listing_repository::{ListingRepository, ListingSink, PersistResult};
pub use logging::{init_logging, init_logging_with_config};
pub use notifier::{LogNotifier, RunNotifier, WebhookNotifier, notifier_for};
pub use parsing::{
    DetailPage, IndexPage, ListingDetailParser, ListingIndexParser, ParsingError, ParsingResult,
};
pub use proxy_pool::{ProxyEndpoint, ProxyPool};
pub use retry_policy::{AttemptFailure, RetryPolicy, RetryState};
