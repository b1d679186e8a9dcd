//! Tracing setup: stdout plus an optional log file from the config.

use std::path::Path;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Keeps the non-blocking writer alive for the process lifetime.
pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init(logging: &LoggingConfig) -> TelemetryGuard {
    let level = if logging.level.is_empty() {
        "info"
    } else {
        &logging.level
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.parse().unwrap_or_else(|_| {
            tracing::level_filters::LevelFilter::INFO.into()
        }))
        .with_env_var("DEPI_LOG")
        .from_env_lossy();

    let mut guards = Vec::new();
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    let file_layer = if logging.file.is_empty() {
        None
    } else {
        let path = Path::new(&logging.file);
        let directory = path.parent().unwrap_or_else(|| Path::new("."));
        let filename = path.file_name().unwrap_or_else(|| "depi.log".as_ref());
        let appender = tracing_appender::rolling::never(directory, filename);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
    };

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer);
    // a second init in the same process (tests) is fine to ignore
    let _ = registry.try_init();

    TelemetryGuard { _guards: guards }
}
