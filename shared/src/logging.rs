use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, Layer,
    filter::{LevelFilter, Targets},
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Flush guards for the file writers. Dropping them stops file logging.
#[must_use = "logs are lost once the guards are dropped"]
pub struct LogGuards(#[allow(dead_code)] Vec<WorkerGuard>);

struct FileSink {
    prefix: &'static str,
    keep: usize,
}

const INFO_SINK: FileSink = FileSink { prefix: "info", keep: 30 };
const DEBUG_SINK: FileSink = FileSink { prefix: "debug", keep: 7 };
const ERROR_SINK: FileSink = FileSink { prefix: "error", keep: 30 };

fn daily_writer(
    log_dir: &Path,
    sink: &FileSink,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(sink.prefix)
        .filename_suffix("log")
        .max_log_files(sink.keep)
        .build(log_dir)
        .with_context(|| format!("Failed to open {} log in {}", sink.prefix, log_dir.display()))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Console output filtered by `RUST_LOG`, plus daily-rotated info, debug and
/// error files under `log_dir`.
pub fn init(log_dir: &Path) -> Result<LogGuards> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create {}", log_dir.display()))?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (info_writer, info_guard) = daily_writer(log_dir, &INFO_SINK)?;
    let (debug_writer, debug_guard) = daily_writer(log_dir, &DEBUG_SINK)?;
    let (error_writer, error_guard) = daily_writer(log_dir, &ERROR_SINK)?;

    // Dependencies are chatty at debug level
    let debug_targets = Targets::new()
        .with_default(LevelFilter::INFO)
        .with_target("kiana_bot", LevelFilter::DEBUG)
        .with_target("shared", LevelFilter::DEBUG);

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_filter(env_filter))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(info_writer)
                .with_filter(LevelFilter::INFO),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(debug_writer)
                .with_filter(debug_targets),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(error_writer)
                .with_filter(LevelFilter::ERROR),
        )
        .try_init()
        .context("Tracing already initialised")?;

    Ok(LogGuards(vec![info_guard, debug_guard, error_guard]))
}

/// Initialise tracing with log files in `./log`.
#[macro_export]
macro_rules! init_tracing {
    () => {
        $crate::logging::init(std::path::Path::new("log"))
    };
}
