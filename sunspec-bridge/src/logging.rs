use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directive for a configured log level.
///
/// Accepts the usual level names in any case, plus `WARNING` and `CRITICAL`.
pub fn level_directive(level: &str) -> Option<&'static str> {
    let directive = match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "INFO" => "info",
        "WARN" | "WARNING" => "warn",
        "ERROR" | "CRITICAL" => "error",
        "OFF" => "off",
        _ => return None,
    };
    Some(directive)
}

/// Open `path` for appending and wrap it in a background writer.
///
/// The returned guard flushes pending lines when dropped.
pub fn open_log_file(path: &Path) -> io::Result<(NonBlocking, WorkerGuard)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(tracing_appender::non_blocking(file))
}

/// Console subscriber, plus a plain text file layer when `file` is given.
pub fn subscriber(filter: EnvFilter, file: Option<NonBlocking>) -> impl Subscriber + Send + Sync {
    let file_layer = file.map(|writer| {
        fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
///
/// Lines also go to `file` when it can be opened; otherwise logging stays on
/// the console only. Keep the returned guard alive until exit.
pub fn init(
    level: &str,
    file: Option<&Path>,
) -> Result<Option<WorkerGuard>, tracing_subscriber::util::TryInitError> {
    let default_directive = level_directive(level).unwrap_or("info");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let opened = file.map(|path| (path, open_log_file(path)));
    let (writer, guard, open_error) = match opened {
        Some((_, Ok((writer, guard)))) => (Some(writer), Some(guard), None),
        Some((path, Err(err))) => (None, None, Some((path, err))),
        None => (None, None, None),
    };

    subscriber(env_filter, writer).try_init()?;

    if let Some((path, err)) = open_error {
        tracing::warn!(path = %path.display(), %err, "cannot open log file, logging to console only");
    }
    Ok(guard)
}
