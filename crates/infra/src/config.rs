//! Process configuration read from `ORDERFLOW_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use orderflow_observability::LogFormat;
use thiserror::Error;

pub const DATABASE_URL: &str = "ORDERFLOW_DATABASE_URL";
pub const DB_MAX_CONNECTIONS: &str = "ORDERFLOW_DB_MAX_CONNECTIONS";
pub const WORKERS: &str = "ORDERFLOW_WORKERS";
pub const POLL_INTERVAL_MS: &str = "ORDERFLOW_POLL_INTERVAL_MS";
pub const TASK_TIMEOUT_SECS: &str = "ORDERFLOW_TASK_TIMEOUT_SECS";
pub const LOG_FORMAT: &str = "ORDERFLOW_LOG_FORMAT";
pub const TASK_RETENTION_HOURS: &str = "ORDERFLOW_TASK_RETENTION_HOURS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub workers: usize,
    pub poll_interval: Duration,
    /// `None` disables the per-task timeout
    pub task_timeout: Option<Duration>,
    pub log_format: LogFormat,
    /// How long succeeded and terminally failed tasks are kept
    pub task_retention: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://orderflow.db?mode=rwc".to_string(),
            db_max_connections: 8,
            workers: 4,
            poll_interval: Duration::from_millis(100),
            task_timeout: None,
            log_format: LogFormat::Json,
            task_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(DATABASE_URL) {
            config.database_url = url;
        }
        if let Some(n) = parse::<u32>(DB_MAX_CONNECTIONS, get(DB_MAX_CONNECTIONS))? {
            config.db_max_connections = positive(DB_MAX_CONNECTIONS, n)?;
        }
        if let Some(n) = parse::<usize>(WORKERS, get(WORKERS))? {
            config.workers = positive(WORKERS, n)?;
        }
        if let Some(ms) = parse::<u64>(POLL_INTERVAL_MS, get(POLL_INTERVAL_MS))? {
            config.poll_interval = Duration::from_millis(positive(POLL_INTERVAL_MS, ms)?);
        }
        if let Some(secs) = parse::<u64>(TASK_TIMEOUT_SECS, get(TASK_TIMEOUT_SECS))? {
            config.task_timeout = Some(Duration::from_secs(positive(TASK_TIMEOUT_SECS, secs)?));
        }
        if let Some(hours) = parse::<u64>(TASK_RETENTION_HOURS, get(TASK_RETENTION_HOURS))? {
            let hours = positive(TASK_RETENTION_HOURS, hours)?;
            config.task_retention = Duration::from_secs(hours.saturating_mul(3600));
        }
        if let Some(format) = get(LOG_FORMAT) {
            config.log_format = format.parse().map_err(|_| ConfigError::Invalid {
                key: LOG_FORMAT,
                value: format,
            })?;
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(key: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError> {
    raw.map(|value| {
        value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value })
    })
    .transpose()
}

fn positive<T: PartialEq + Default + ToString>(key: &'static str, n: T) -> Result<T, ConfigError> {
    if n == T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: n.to_string(),
        });
    }
    Ok(n)
}
