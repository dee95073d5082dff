use std::fs;
use std::path::Path;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::config::CONFIG;

/// Keeps the non-blocking file writers flushing until dropped.
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

fn parse_log_level(value: &str) -> LevelFilter {
    match value.trim().to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

const TIMING_TARGET: &str = "terrasense.timing";

fn daily_writer(dir: &Path, file_name: &str) -> (NonBlocking, WorkerGuard) {
    tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name))
}

/// Installs the global subscriber:
/// - stderr and `terrasense.log` get application events at `LOG_LEVEL`
/// - `timing.jsonl` gets only the LLM timing events, one JSON object per line
///
/// Console output goes to stderr so command results on stdout stay
/// machine-readable.
pub fn init_logging() -> LoggingGuards {
    let logs_dir = Path::new(&CONFIG.log_dir);
    if let Err(err) = fs::create_dir_all(logs_dir) {
        eprintln!("Failed to create logs directory {}: {err}", logs_dir.display());
    }

    let (file_writer, file_guard) = daily_writer(logs_dir, "terrasense.log");
    let (timing_writer, timing_guard) = daily_writer(logs_dir, "timing.jsonl");

    let app_filter = Targets::new()
        .with_default(parse_log_level(&CONFIG.log_level))
        .with_target(TIMING_TARGET, LevelFilter::OFF)
        .with_target("hyper", LevelFilter::WARN)
        .with_target("hyper_util", LevelFilter::WARN)
        .with_target("reqwest", LevelFilter::WARN)
        .with_target("sqlx", LevelFilter::WARN);

    let app_layers = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .and_then(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .with_filter(app_filter);
    let timing_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(timing_writer)
        .with_filter(Targets::new().with_target(TIMING_TARGET, LevelFilter::INFO));

    tracing_subscriber::registry()
        .with(app_layers)
        .with(timing_layer)
        .init();

    LoggingGuards {
        _guards: vec![file_guard, timing_guard],
    }
}
