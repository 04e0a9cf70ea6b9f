//! Tracing bootstrap shared by embedders (feature `tracing-init`).
//!
//! Console layer filtered by `RUST_LOG` (default `info`), plus an optional
//! daily-rotating file appender. The returned guard must be held for the
//! process lifetime or buffered file output is lost.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Installs the global subscriber: stderr layer with `RUST_LOG` filtering and,
/// when `log_dir` is given, a daily-rotating `<app_name>.log` file layer.
///
/// Returns the file appender guard (`None` without `log_dir`). Calling twice
/// returns an error from the underlying registry; embedders should call once
/// at startup.
pub fn init(
    app_name: &str,
    log_dir: Option<&Path>,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter);

    match log_dir {
        Some(dir) => {
            let appender =
                tracing_appender::rolling::daily(dir, format!("{app_name}.log"));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(file_filter);
            tracing_subscriber::registry()
                .with(console)
                .with(file)
                .try_init()?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(console).try_init()?;
            Ok(None)
        }
    }
}
