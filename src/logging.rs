//! Logging setup for runtime binaries.
//!
//! Layered `tracing` subscriber: an `EnvFilter`-controlled stderr layer
//! for operators, plus an optional non-blocking file layer when a server
//! is given a `log_file_path` (the same path it reports back in pongs).

use std::path::Path;

use anyhow::Result;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Keeps the non-blocking file writer alive.
///
/// Dropping the guard flushes and stops file logging, so binaries hold it
/// for their whole lifetime.
pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialize the global subscriber.
///
/// `default_level` applies when `RUST_LOG` is unset. Returns the guard for
/// the file writer; harmless to drop when no file was configured.
pub fn init(log_file: Option<&Path>, default_level: &str) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let (file_layer, file_guard) = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("zmqruntime.log"));
            let appender =
                tracing_appender::rolling::never(dir.unwrap_or_else(|| Path::new(".")), file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}
