//! Tracing setup for the two roles.
//!
//! The client logs to stderr so the menu on stdout stays readable. The
//! server logs to a file under the configured directory, named after the
//! moment the process started.

use chrono::{DateTime, Local};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn filter(level: &str, verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { level };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Log file stem for a server started at `started`
#[must_use]
pub fn server_log_stem(started: DateTime<Local>) -> String {
    started.format("%a-%b-%d-%H-%M-%S-%Y").to_string()
}

/// Log to stderr
pub fn init_client(level: &str, verbose: bool) {
    tracing_subscriber::registry()
        .with(filter(level, verbose))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Log to `<dir>/<start time>.log` through a non-blocking writer. The guard
/// must stay alive until the process exits.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be created.
pub fn init_server(dir: &Path, level: &str, verbose: bool) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(server_log_stem(Local::now()))
        .filename_suffix("log")
        .build(dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter(level, verbose))
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(guard)
}
