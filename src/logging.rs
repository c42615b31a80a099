use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_LEVEL_ENV: &str = "COCKPIT_TASKS_LOG_LEVEL";
const LOG_FILE_PREFIX: &str = "cockpit-tasks";
const LOG_FILE_SUFFIX: &str = "log";
/// Daily files kept; older ones are removed by the appender.
const MAX_LOG_FILES: usize = 14;

/// Installs the file logger and returns today's log file.
pub fn init_logging() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let log_dir = get_log_directory()?;
    fs::create_dir_all(&log_dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(MAX_LOG_FILES)
        .build(&log_dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    std::mem::forget(guard);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(build_log_filter(std::env::var(LOG_LEVEL_ENV).ok().as_deref()))
        .with(file_layer)
        .init();

    let log_file_path = current_log_file_path(&log_dir, Utc::now());
    tracing::info!(
        version = env!("COCKPIT_TASKS_BUILD_VERSION"),
        "logging to {}",
        log_file_path.display()
    );

    Ok(log_file_path)
}

fn build_log_filter(raw_level: Option<&str>) -> EnvFilter {
    let level = raw_level.and_then(normalize_log_level).unwrap_or("warn");
    EnvFilter::new(format!("warn,cockpit_tasks={level}"))
}

fn normalize_log_level(raw: &str) -> Option<&'static str> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" => Some("error"),
        _ => None,
    }
}

pub fn get_log_directory() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let data_dir = dirs::data_local_dir().ok_or("Failed to determine local data directory")?;
    Ok(data_dir.join("cockpit-tasks").join("logs"))
}

/// Name the daily appender gives the file for `now` (UTC date).
pub fn current_log_file_path(log_dir: &Path, now: DateTime<Utc>) -> PathBuf {
    log_dir.join(format!(
        "{LOG_FILE_PREFIX}.{}.{LOG_FILE_SUFFIX}",
        now.format("%Y-%m-%d")
    ))
}
