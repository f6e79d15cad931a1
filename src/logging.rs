//! Console plus file logging.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::error::CollectorError;

/// Installs the global subscriber.
///
/// The console honours `RUST_LOG` (default `info`); the log file always
/// receives `debug` and above. Keep the returned guard alive for the
/// lifetime of the process or buffered file lines are lost.
pub fn init(log_file: &Path) -> Result<WorkerGuard, CollectorError> {
    let dir = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = log_file
        .file_name()
        .ok_or_else(|| CollectorError::Logging(format!("not a file: {}", log_file.display())))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));

    let console = fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    let file = fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(LevelFilter::DEBUG);

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| CollectorError::Logging(e.to_string()))?;

    Ok(guard)
}
