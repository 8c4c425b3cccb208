//! Configuration parsing and management.
//!
//! A `warden.toml` file defines where registry and log files live, how many
//! workers a daemon keeps alive, and the engine's fixed intervals. Every
//! section is optional; defaults reproduce the documented behavior.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::task::{PoolSettings, TaskName};

/// Environment variable overriding [`PathsConfig::tmp_dir`].
pub const TMP_DIR_ENV: &str = "WARDEN_TMP_DIR";

/// Environment variable overriding [`PathsConfig::logs_dir`].
pub const LOGS_DIR_ENV: &str = "WARDEN_LOGS_DIR";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct WardenConfig {
    /// Filesystem locations.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Worker pool sizing.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Engine intervals.
    #[serde(default)]
    pub timing: Timings,
}

impl WardenConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from `path` when it exists, defaults otherwise, and
    /// apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read, parsed, or
    /// validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var_os(key));
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value is out of range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for a zero worker count or a zero
    /// poll interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.workers == 0 {
            return Err(ConfigError::Validation(
                "pool.workers must be at least 1".to_string(),
            ));
        }
        if self.timing.poll_interval.is_zero() {
            return Err(ConfigError::Validation(
                "timing.poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `WARDEN_TMP_DIR` / `WARDEN_LOGS_DIR` through a lookup function.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<std::ffi::OsString>,
    {
        if let Some(dir) = lookup(TMP_DIR_ENV).filter(|v| !v.is_empty()) {
            self.paths.tmp_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(LOGS_DIR_ENV).filter(|v| !v.is_empty()) {
            self.paths.logs_dir = PathBuf::from(dir);
        }
    }

    /// Initial pool settings handed to the task's set-up hook.
    #[must_use]
    pub const fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            workers: self.pool.workers,
        }
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathsConfig {
    /// Directory holding the hidden registry (pid) files.
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,

    /// Directory holding daemon log files.
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
}

impl PathsConfig {
    /// `<tmp_dir>/.<stem>.pid`
    #[must_use]
    pub fn registry_file(&self, stem: &str) -> PathBuf {
        self.tmp_dir.join(format!(".{stem}.pid"))
    }

    /// `<logs_dir>/<name with ':' replaced by '.'>.log`
    #[must_use]
    pub fn log_file(&self, name: &TaskName) -> PathBuf {
        self.logs_dir.join(format!("{}.log", name.log_file_stem()))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            tmp_dir: default_tmp_dir(),
            logs_dir: default_logs_dir(),
        }
    }
}

fn default_tmp_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_logs_dir() -> PathBuf {
    std::env::temp_dir().join("warden").join("logs")
}

/// Worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker processes per daemon.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

const fn default_workers() -> usize {
    2
}

/// Fixed intervals of the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Timings {
    /// Supervisor fill/reap/drain cycle.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Pause after a failed work unit.
    #[serde(default = "default_failure_backoff", with = "humantime_serde")]
    pub failure_backoff: Duration,

    /// Pause between successful work units.
    #[serde(default = "default_iteration_pause", with = "humantime_serde")]
    pub iteration_pause: Duration,

    /// Pause before a worker process exits.
    #[serde(default = "default_exit_pause", with = "humantime_serde")]
    pub exit_pause: Duration,

    /// Gap between `stop` and `start` during `restart`.
    #[serde(default = "default_restart_grace", with = "humantime_serde")]
    pub restart_grace: Duration,

    /// Upper bound on waiting for a non-child supervisor to exit during `stop`.
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            failure_backoff: default_failure_backoff(),
            iteration_pause: default_iteration_pause(),
            exit_pause: default_exit_pause(),
            restart_grace: default_restart_grace(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

const fn default_failure_backoff() -> Duration {
    Duration::from_secs(1)
}

const fn default_iteration_pause() -> Duration {
    Duration::from_micros(500)
}

const fn default_exit_pause() -> Duration {
    Duration::from_millis(1)
}

const fn default_restart_grace() -> Duration {
    Duration::from_secs(3)
}

const fn default_stop_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
