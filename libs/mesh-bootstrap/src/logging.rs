//! Global `tracing` subscriber.
//!
//! Console output goes to stderr; an optional size-rotated file receives the
//! same events. Both sinks are written by background workers, so the guard
//! returned by [`init_logging`] must live until the process exits or buffered
//! lines are lost.

use std::path::Path;

use anyhow::Context as _;
use file_rotate::compression::Compression;
use file_rotate::suffix::AppendCount;
use file_rotate::{ContentLimit, FileRotate};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogFormat, LoggingConfig};
use crate::paths::expand_tilde;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Flushes pending log lines when dropped.
#[must_use = "dropping the guard stops the log writers"]
pub struct LoggingGuard {
    _workers: Vec<WorkerGuard>,
}

/// Filter from `RUST_LOG` if set, else from the configured level.
#[must_use]
pub fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn fmt_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Text => fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(true)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
    }
}

#[cfg(unix)]
fn rotating_file(path: &Path, max_bytes: usize, keep: usize) -> FileRotate<AppendCount> {
    FileRotate::new(
        path,
        AppendCount::new(keep),
        ContentLimit::Bytes(max_bytes),
        Compression::None,
        None,
    )
}

#[cfg(not(unix))]
fn rotating_file(path: &Path, max_bytes: usize, keep: usize) -> FileRotate<AppendCount> {
    FileRotate::new(
        path,
        AppendCount::new(keep),
        ContentLimit::Bytes(max_bytes),
        Compression::None,
    )
}

/// Install the global subscriber and bridge `log` records into it.
///
/// # Errors
/// Returns an error if the log file directory cannot be created or a global
/// subscriber is already installed.
pub fn init_logging(cfg: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    let mut workers = Vec::new();
    let mut layers: Vec<BoxedLayer> = Vec::new();

    let (console, guard) = tracing_appender::non_blocking(std::io::stderr());
    workers.push(guard);
    layers.push(fmt_layer(cfg.format, console, cfg.ansi));

    if let Some(raw) = cfg.file.as_deref() {
        let path = expand_tilde(raw)?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        }
        let max_bytes = usize::try_from(cfg.file_max_size_mb.saturating_mul(1024 * 1024))
            .unwrap_or(usize::MAX);
        let file = rotating_file(&path, max_bytes, cfg.file_max_files.max(1));
        let (writer, guard) = tracing_appender::non_blocking(file);
        workers.push(guard);
        layers.push(fmt_layer(cfg.format, writer, false));
    }

    let subscriber = tracing_subscriber::registry()
        .with(layers)
        .with(build_filter(&cfg.level));
    tracing::subscriber::set_global_default(subscriber)
        .context("a global tracing subscriber is already installed")?;
    tracing_log::LogTracer::init().ok();

    tracing::debug!(
        level = %cfg.level,
        file = cfg.file.as_deref().unwrap_or("-"),
        "logging initialized"
    );
    Ok(LoggingGuard { _workers: workers })
}
