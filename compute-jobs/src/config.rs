//! Process configuration.
//!
//! Everything is read from `COMPUTE_JOBS_*` environment variables (a `.env`
//! file is loaded by the binary first). Unset variables fall back to the
//! defaults below; set but unparsable ones are configuration errors.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logging::DEFAULT_LOG_FILTER;
use crate::{Error, Result};

pub const ENV_PREFIX: &str = "COMPUTE_JOBS_";

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub filter: String,
    /// Directory for daily rotated log files. Console only when `None`.
    pub dir: Option<PathBuf>,
    /// Rotated files older than this many days are deleted; 0 keeps all.
    pub retention_days: i64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            dir: None,
            retention_days: 7,
        }
    }
}

/// Status reconciler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Delay between the end of one sweep and the start of the next.
    pub poll_interval_ms: u64,
    /// Polls in flight at once within a sweep.
    pub max_concurrent_polls: usize,
    /// Consecutive retryable poll failures before a job is marked
    /// unreachable.
    pub failure_ceiling: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30_000,
            max_concurrent_polls: 8,
            failure_ceiling: 5,
        }
    }
}

impl ReconcilerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Job manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Upper bound on any single backend call.
    pub backend_timeout_ms: u64,
    /// Compare-and-set attempts before giving up on a contended record.
    pub max_update_attempts: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            backend_timeout_ms: 10_000,
            max_update_attempts: 8,
        }
    }
}

impl ManagerConfig {
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    /// JSON file with the scheduler endpoint array.
    pub scheduler_registry: PathBuf,
    pub workspace_root: PathBuf,
    pub log: LogConfig,
    pub reconciler: ReconcilerConfig,
    pub manager: ManagerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:compute-jobs.db?mode=rwc".to_string(),
            scheduler_registry: PathBuf::from("schedulers.json"),
            workspace_root: PathBuf::from("workspaces"),
            log: LogConfig::default(),
            reconciler: ReconcilerConfig::default(),
            manager: ManagerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to read `COMPUTE_JOBS_*` variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(url) = var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(path) = var("SCHEDULERS") {
            config.scheduler_registry = PathBuf::from(path);
        }
        if let Some(path) = var("WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(path);
        }

        if let Some(filter) = var("LOG_FILTER") {
            config.log.filter = filter;
        }
        if let Some(dir) = var("LOG_DIR") {
            config.log.dir = Some(PathBuf::from(dir));
        }
        parse_into(&var, "LOG_RETENTION_DAYS", &mut config.log.retention_days)?;

        parse_into(
            &var,
            "POLL_INTERVAL_MS",
            &mut config.reconciler.poll_interval_ms,
        )?;
        parse_into(
            &var,
            "MAX_CONCURRENT_POLLS",
            &mut config.reconciler.max_concurrent_polls,
        )?;
        parse_into(
            &var,
            "FAILURE_CEILING",
            &mut config.reconciler.failure_ceiling,
        )?;
        parse_into(
            &var,
            "BACKEND_TIMEOUT_MS",
            &mut config.manager.backend_timeout_ms,
        )?;
        parse_into(
            &var,
            "MAX_UPDATE_ATTEMPTS",
            &mut config.manager.max_update_attempts,
        )?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reconciler.poll_interval_ms == 0 {
            return Err(Error::config("poll interval must be positive"));
        }
        if self.reconciler.max_concurrent_polls == 0 {
            return Err(Error::config("max concurrent polls must be at least 1"));
        }
        if self.reconciler.failure_ceiling == 0 {
            return Err(Error::config("failure ceiling must be at least 1"));
        }
        if self.manager.backend_timeout_ms == 0 {
            return Err(Error::config("backend timeout must be positive"));
        }
        if self.manager.max_update_attempts == 0 {
            return Err(Error::config("max update attempts must be at least 1"));
        }
        Ok(())
    }
}

fn parse_into<T>(var: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = var(name) {
        *slot = raw
            .parse()
            .map_err(|e| Error::config(format!("{ENV_PREFIX}{name}='{raw}': {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.reconciler.failure_ceiling, 5);
        assert_eq!(config.manager.backend_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("COMPUTE_JOBS_DATABASE_URL", "sqlite::memory:"),
            ("COMPUTE_JOBS_LOG_DIR", "/var/log/compute-jobs"),
            ("COMPUTE_JOBS_POLL_INTERVAL_MS", "500"),
            ("COMPUTE_JOBS_MAX_CONCURRENT_POLLS", "32"),
            ("COMPUTE_JOBS_FAILURE_CEILING", " 3 "),
        ]))
        .unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(
            config.log.dir.as_deref(),
            Some(std::path::Path::new("/var/log/compute-jobs"))
        );
        assert_eq!(config.reconciler.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.reconciler.max_concurrent_polls, 32);
        assert_eq!(config.reconciler.failure_ceiling, 3);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let err = AppConfig::from_lookup(lookup(&[("COMPUTE_JOBS_FAILURE_CEILING", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("COMPUTE_JOBS_FAILURE_CEILING"));

        assert!(AppConfig::from_lookup(lookup(&[("COMPUTE_JOBS_MAX_CONCURRENT_POLLS", "0")])).is_err());
    }
}
