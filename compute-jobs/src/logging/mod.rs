//! Logging setup with a reloadable filter and optional rolling log files.
//!
//! This module provides:
//! - Runtime log level changes via `tracing_subscriber::reload`
//! - Daily rotated log files through `tracing-appender`
//! - Retention cleanup of rotated files
//! - Local timezone timestamps

use chrono::{Local, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::config::LogConfig;

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "compute_jobs=info,sqlx=warn,reqwest=warn";

/// File name prefix of rotated log files.
const LOG_FILE_PREFIX: &str = "compute-jobs.log";

/// Interval between retention sweeps of the log directory.
const RETENTION_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Timer that formats timestamps in the server's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Type alias for the reload handle.
pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Handle to the installed subscriber.
///
/// Keep it alive for the lifetime of the process: dropping it flushes and
/// stops the background file writer.
pub struct LoggingHandle {
    filter: FilterHandle,
    log_dir: Option<PathBuf>,
    retention_days: i64,
    _guard: Option<WorkerGuard>,
}

impl LoggingHandle {
    /// Get the current filter directive string.
    pub fn get_filter(&self) -> String {
        self.filter
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the filter directive, e.g. `"compute_jobs=debug,sqlx=warn"`.
    pub fn set_filter(&self, directive: &str) -> crate::Result<()> {
        let new_filter = EnvFilter::try_new(directive)
            .map_err(|e| crate::Error::config(format!("Invalid filter directive: {}", e)))?;

        self.filter
            .reload(new_filter)
            .map_err(|e| crate::Error::Other(format!("Failed to reload filter: {}", e)))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    /// Periodically delete rotated log files past the retention period.
    ///
    /// Does nothing when logging to files is disabled.
    pub fn start_retention_cleanup(self: &Arc<Self>, cancel_token: CancellationToken) {
        let Some(log_dir) = self.log_dir.clone() else {
            return;
        };
        let retention_days = self.retention_days;

        tokio::spawn(async move {
            loop {
                if let Err(e) = cleanup_old_logs(&log_dir, retention_days).await {
                    warn!(error = %e, "Failed to cleanup old logs");
                }
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Log retention cleanup task shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(RETENTION_CHECK_INTERVAL) => {}
                }
            }
        });
    }
}

/// Delete rotated log files (`compute-jobs.log.YYYY-MM-DD`) older than
/// `retention_days`. Returns the number of deleted files.
pub async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    if retention_days <= 0 {
        return Ok(0);
    }
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).date_naive();

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted_count = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }

        let Some(date_str) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(LOG_FILE_PREFIX))
            .and_then(|n| n.strip_prefix('.'))
        else {
            continue;
        };

        let Ok(file_date) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
            continue;
        };

        if file_date < cutoff {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    deleted_count += 1;
                    debug!(path = %path.display(), "Deleted old log file");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete old log file");
                }
            }
        }
    }

    if deleted_count > 0 {
        info!(count = deleted_count, "Cleaned up old log files");
    }

    Ok(deleted_count)
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured filter. Console output is
/// always on; a daily rotated file is added when `config.dir` is set.
pub fn init_logging(config: &LogConfig) -> crate::Result<Arc<LoggingHandle>> {
    let initial_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| crate::Error::config(format!("Invalid log filter: {}", e)))?;
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_timer(LocalTimer))
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            crate::Error::Other(format!("Failed to set global default subscriber: {}", e))
        })?;

    Ok(Arc::new(LoggingHandle {
        filter: filter_handle,
        log_dir: config.dir.clone(),
        retention_days: config.retention_days,
        _guard: guard,
    }))
}
