//! Pipeline configuration.

use crate::logging::default_log_level;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_DB_FILE_NAME: &str = "heartbeat.sqlite3";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    EmptyDbPath,
    RelativeLogDir(PathBuf),
    PollIntervalTooShort(Duration),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyDbPath => write!(f, "db_path cannot be empty"),
            Self::RelativeLogDir(path) => {
                write!(f, "log_dir must be absolute, got `{}`", path.display())
            }
            Self::PollIntervalTooShort(value) => write!(
                f,
                "poll interval {}ms is below the {}ms minimum",
                value.as_millis(),
                MIN_POLL_INTERVAL.as_millis()
            ),
        }
    }
}

impl Error for ConfigError {}

/// Runtime settings for one relay process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// SQLite file holding cursor, identity and the local document store.
    pub db_path: PathBuf,
    /// Absolute log directory; `None` leaves logging uninitialized.
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
    /// Periodic wake interval; `None` relies on source notifications only.
    pub poll_interval: Option<Duration>,
    /// `false` selects the local-display-only sink set.
    pub publish: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: std::env::temp_dir().join(DEFAULT_DB_FILE_NAME),
            log_dir: None,
            log_level: default_log_level().to_string(),
            poll_interval: Some(DEFAULT_POLL_INTERVAL),
            publish: true,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyDbPath);
        }
        if let Some(log_dir) = &self.log_dir {
            if !log_dir.is_absolute() {
                return Err(ConfigError::RelativeLogDir(log_dir.clone()));
            }
        }
        if let Some(interval) = self.poll_interval {
            if interval < MIN_POLL_INTERVAL {
                return Err(ConfigError::PollIntervalTooShort(interval));
            }
        }
        Ok(())
    }
}
