//! autos-crawler binary
//!
//! Usage: `autos-crawler [--config <file.toml>]`. Settings come from the
//! optional TOML file and `CRAWLER_*` environment variables. Exit status is
//! 0 when the range completed, 130 when interrupted, 1 on failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use autos_crawler::application::{CheckpointManager, CrawlPipeline, RunReporter};
use autos_crawler::domain::CrawlMetrics;
use autos_crawler::infrastructure::{
    CheckpointStore, DatabaseConnection, ListingRepository, ListingSink, PageFetcher,
    PipelineConfig, RateLimitedFetcher, init_logging, init_logging_with_config, notifier_for,
};

#[derive(Parser, Debug)]
#[command(name = "autos-crawler")]
#[command(about = "Crawl turbo.az car listings into SQLite")]
#[command(version)]
struct Cli {
    /// TOML settings file; `CRAWLER_*` environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match PipelineConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            if init_logging().is_err() {
                eprintln!("Configuration error: {e}");
            }
            error!("Configuration error: {}", e);
            return ExitCode::from(1);
        }
    };

    if let Err(e) = init_logging_with_config(&config.logging) {
        eprintln!("Failed to initialize logging: {e:#}");
    }

    match run(config).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            error!("Crawler failed to start: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(config: PipelineConfig) -> Result<i32> {
    info!(
        "Starting crawl of pages {}-{} from {}",
        config.start_page, config.end_page, config.base_url
    );
    if config.uses_direct_connection() {
        info!("Proxies disabled, connecting directly");
    }

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    let db = DatabaseConnection::new(&config.database_url).await?;
    db.migrate().await.context("Database migration failed")?;

    let store = CheckpointStore::new(&config.checkpoint_path);
    let checkpoint = CheckpointManager::load_or_fresh(&store, config.start_page, config.end_page).await;
    let metrics = Arc::new(CrawlMetrics::from_counters(&checkpoint.counters));

    let fetcher: Arc<dyn PageFetcher> = Arc::new(RateLimitedFetcher::new(
        &config,
        Arc::clone(&metrics),
        cancel.clone(),
    )?);
    let sink: Arc<dyn ListingSink> = Arc::new(ListingRepository::new(db.pool().clone()));
    let checkpoints = CheckpointManager::new(
        store,
        sink,
        Arc::clone(&metrics),
        checkpoint,
        config.checkpoint_interval,
    );

    let reporter = RunReporter::new(
        config.cost_per_gb_usd,
        notifier_for(config.notify_webhook_url.as_deref())?,
    );
    info!("Run id {}", reporter.run_id());

    let pipeline = CrawlPipeline::new(&config, fetcher, checkpoints, metrics, cancel)?;
    let summary = pipeline.run().await;
    let stats = reporter.report(&summary).await;

    db.close().await;
    Ok(stats.outcome.exit_code())
}

/// Cancel the crawl on Ctrl-C or SIGTERM
fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                    return;
                }
                info!("Received Ctrl-C, finishing in-flight listings");
            }
            () = wait_for_sigterm() => {
                info!("Received SIGTERM, finishing in-flight listings");
            }
        }
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
