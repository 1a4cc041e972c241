//! Structured logging initialization.
//!
//! `RUST_LOG` always wins over the configured level.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Human-readable output at `info` unless `RUST_LOG` says otherwise.
///
/// # Example
/// ```no_run
/// use sovereign_core::logging;
///
/// logging::init();
/// tracing::info!("Application started");
/// ```
pub fn init() {
    tracing_subscriber::registry()
        .with(filter("info"))
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// JSON output for log aggregation.
pub fn init_json() {
    tracing_subscriber::registry()
        .with(filter("info"))
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .init();
}

/// Initialize from the `[logging]` section. Safe to call more than once;
/// later calls are ignored.
pub fn init_from_config(config: &LoggingConfig) {
    let registry = tracing_subscriber::registry().with(filter(&config.level));
    let result = if config.json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("logging already initialized");
    }
}
