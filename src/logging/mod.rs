//! Logging setup and log-directory maintenance
//!
//! Tracing with an env-filter, mirrored to the console and to a daily
//! rolling file in the configured log directory. The maintenance helpers
//! behind `--log-stats` and `--archive-logs` work on the dated file names
//! the rolling appender produces (`feeder_hub.log.YYYY-MM-DD`).

use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Base name of the rolling log file
pub const LOG_FILE_PREFIX: &str = "feeder_hub.log";

/// Initialize tracing. Returns the appender guard, which must stay alive
/// for the lifetime of the process so buffered lines get flushed.
pub fn init(config: &LoggingConfig, verbose: bool) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)?;

    let level = if verbose {
        "debug".to_string()
    } else {
        config.level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("feeder_hub={level}")));

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false);
    let console_layer = config
        .console_output
        .then(|| tracing_subscriber::fmt::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    Ok(guard)
}

/// One log file as reported by `--log-stats`
#[derive(Debug, Clone)]
pub struct LogFileInfo {
    pub path: PathBuf,
    pub size: u64,
}

/// Aggregate statistics over the log directory
#[derive(Debug, Clone, Default)]
pub struct LogStats {
    pub files: Vec<LogFileInfo>,
    pub total_size: u64,
}

/// Collect sizes of all rolling log files in `log_dir`.
pub fn log_stats(log_dir: &Path) -> std::io::Result<LogStats> {
    let mut stats = LogStats::default();
    if !log_dir.exists() {
        return Ok(stats);
    }
    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !is_log_file(&path) {
            continue;
        }
        let size = entry.metadata()?.len();
        stats.total_size += size;
        stats.files.push(LogFileInfo { path, size });
    }
    stats.files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(stats)
}

/// Move every dated log file except today's active one into
/// `log_dir/archive`. Returns the number of files moved.
pub fn archive_logs(log_dir: &Path) -> std::io::Result<usize> {
    let today = Local::now().date_naive();
    let archive_dir = log_dir.join("archive");
    let mut moved = 0;

    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        if log_file_date(&path).is_none_or(|date| date >= today) {
            continue;
        }
        if moved == 0 {
            std::fs::create_dir_all(&archive_dir)?;
        }
        let file_name = entry.file_name();
        std::fs::rename(&path, archive_dir.join(file_name))?;
        moved += 1;
    }
    Ok(moved)
}

/// Delete dated log files older than `max_age_days`. Returns the number of
/// files removed.
pub fn cleanup_old_logs(log_dir: &Path, max_age_days: u32) -> std::io::Result<usize> {
    let cutoff = Local::now().date_naive() - chrono::Days::new(u64::from(max_age_days));
    let mut removed = 0;
    if !log_dir.exists() {
        return Ok(removed);
    }
    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        if log_file_date(&path).is_some_and(|date| date < cutoff) {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn is_log_file(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
}

/// Date suffix of a rolled file (`feeder_hub.log.2026-08-01`); `None` for
/// anything else, including the undated active file.
fn log_file_date(path: &Path) -> Option<NaiveDate> {
    let name = path.file_name()?.to_str()?;
    let suffix = name.strip_prefix(LOG_FILE_PREFIX)?.strip_prefix('.')?;
    NaiveDate::parse_from_str(suffix, "%Y-%m-%d").ok()
}
