//! Logging Infrastructure
//!
//! `tracing` subscriber setup: stdout always, plus a daily rolling file when a
//! log directory is configured. `RUST_LOG` wins over the configured level.

use std::path::Path;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "storefront-engine";

/// Initialize the logger with the default level
pub fn init_logger() {
    let _ = init_logger_with_file(None, None);
}

/// Initialize the logger with optional file output
///
/// Returns the appender guard when logging to a file; keep it alive for the
/// lifetime of the process so buffered lines are flushed.
pub fn init_logger_with_file(
    log_level: Option<&str>,
    log_dir: Option<&str>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = log_level.unwrap_or("info");
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_target(false);

    if let Some(dir) = log_dir {
        let log_path = Path::new(dir);
        if std::fs::create_dir_all(log_path).is_ok() {
            let file_appender = tracing_appender::rolling::daily(log_path, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(file_appender);
            if builder.with_ansi(false).with_writer(writer).try_init().is_err() {
                eprintln!("Logger already initialized");
            }
            return Some(guard);
        }
        eprintln!("Log directory {} is not usable, logging to stdout", dir);
    }

    if builder.try_init().is_err() {
        eprintln!("Logger already initialized");
    }
    None
}
