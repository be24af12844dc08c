//! Logging system configuration and initialization
//!
//! Console output by default, optionally a plain or JSON log file written
//! through a non-blocking appender. `RUST_LOG` overrides the configured
//! filter entirely.

use anyhow::{Result, anyhow};
use lazy_static::lazy_static;
use std::sync::Mutex;
use tracing::info;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    EnvFilter, Registry,
    Layer,
    fmt::{self, time::ChronoUtc},
    layer::{Layered, SubscriberExt},
    util::SubscriberInitExt,
};

pub use crate::infrastructure::config::LoggingConfig;

// Global guard to keep the log file writer alive
lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<tracing_appender::non_blocking::WorkerGuard>> =
        Mutex::new(Vec::new());
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Dependencies that are too chatty below TRACE
const QUIET_TARGETS: &[(&str, &str)] = &[
    ("sqlx::query", "warn"),
    ("sqlx::sqlite", "warn"),
    ("reqwest", "info"),
    ("hyper", "warn"),
    ("hyper_util", "warn"),
    ("h2", "warn"),
    ("rustls", "warn"),
    ("html5ever", "warn"),
    ("selectors", "warn"),
];

/// Build the filter used when `RUST_LOG` is not set
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(&config.level)
        .map_err(|e| anyhow!("Invalid log level {:?}: {}", config.level, e))?;

    if !config.level.to_lowercase().contains("trace") {
        for (target, level) in QUIET_TARGETS {
            filter = filter.add_directive(format!("{target}={level}").parse()?);
        }
    }
    for (target, level) in &config.module_filters {
        filter = filter.add_directive(
            format!("{target}={level}")
                .parse()
                .map_err(|e| anyhow!("Invalid filter for {}: {}", target, e))?,
        );
    }
    Ok(filter)
}

type BaseSubscriber = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<BaseSubscriber> + Send + Sync>;

/// Output layers selected by the configuration, file first
fn build_layers(config: &LoggingConfig) -> Result<Vec<BoxedLayer>> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.file_output {
        std::fs::create_dir_all(&config.directory).map_err(|e| {
            anyhow!("Failed to create log directory {:?}: {}", config.directory, e)
        })?;
        let file_appender = rolling::daily(&config.directory, &config.file_name);
        let (file_writer, file_guard) = non_blocking(file_appender);

        // Store the guard globally to prevent it from being dropped
        LOG_GUARDS
            .lock()
            .map_err(|_| anyhow!("log guard registry poisoned"))?
            .push(file_guard);

        let file_layer = fmt::Layer::new()
            .with_writer(file_writer)
            .with_timer(ChronoUtc::new(TIME_FORMAT.to_string()))
            .with_target(true)
            .with_ansi(false);
        if config.json_format {
            layers.push(file_layer.json().with_current_span(true).boxed());
        } else {
            layers.push(file_layer.boxed());
        }
    }

    if config.console_output {
        layers.push(
            fmt::Layer::new()
                .with_writer(std::io::stderr)
                .with_timer(ChronoUtc::new(TIME_FORMAT.to_string()))
                .with_target(false)
                .boxed(),
        );
    }

    if layers.is_empty() {
        return Err(anyhow!("No logging output configured"));
    }
    Ok(layers)
}

/// Initialize the global subscriber
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_filter(config)?,
    };
    let layers = build_layers(config)?;
    Registry::default().with(env_filter).with(layers).try_init()?;

    info!(
        level = %config.level,
        json = config.json_format,
        file_output = config.file_output,
        "Logging initialized"
    );
    Ok(())
}

/// Initialize with default settings
pub fn init_logging() -> Result<()> {
    init_logging_with_config(&LoggingConfig::default())
}
