//! Logging Module
//!
//! Structured logging with file output for diagnostics.

use std::path::Path;
use tracing_subscriber::{fmt, EnvFilter, prelude::*};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Initialize logging with console and file output under `log_dir`
pub fn init(log_dir: &Path) {
    // Ensure log directory exists
    let _ = std::fs::create_dir_all(log_dir);

    // Rolling file appender, one file per day
    let file_appender = RollingFileAppender::new(
        Rotation::DAILY,
        log_dir,
        "route-master.log",
    );

    // Create file layer
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(file_appender);

    // Console output only in debug builds
    #[cfg(debug_assertions)]
    let console_layer = Some(
        fmt::layer()
            .with_target(true)
            .pretty()
    );

    #[cfg(not(debug_assertions))]
    let console_layer: Option<fmt::Layer<_>> = None;

    // RUST_LOG wins over the build default
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives()));

    // Build subscriber
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer);

    // Set global subscriber. A second init (tests) keeps the first one.
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Filter used when `RUST_LOG` is unset: quieter in release, HTTP internals at warn
fn default_directives() -> &'static str {
    if cfg!(debug_assertions) {
        "debug,hyper=warn,reqwest=warn"
    } else {
        "info,hyper=warn,reqwest=warn"
    }
}
