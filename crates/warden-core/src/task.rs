//! Task identity, run options, and the work-unit contract.
//!
//! A concrete task implements [`MonitoredTask`]. The engine calls it from
//! three different processes:
//!
//! - the controlling process, to validate options before `start`/`restart`
//! - the daemon (supervisor) process, once, through [`MonitoredTask::set_up`]
//! - every worker process, through [`MonitoredTask::init`] and then
//!   repeatedly through [`MonitoredTask::work`]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Separator used inside task names (`group:task`).
pub const NAME_SEPARATOR: char = ':';

/// Immutable name of a task, e.g. `warden:heartbeat`.
///
/// The name derives both the registry (pid) file name and the log file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskName(String);

impl TaskName {
    /// Create a task name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the raw name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stem of the registry file: separators replaced with `-`.
    #[must_use]
    pub fn pid_file_stem(&self) -> String {
        self.0.replace(NAME_SEPARATOR, "-")
    }

    /// Stem of the log file: separators replaced with `.`.
    #[must_use]
    pub fn log_file_stem(&self) -> String {
        self.0.replace(NAME_SEPARATOR, ".")
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error returned when a `key=value` option cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid option '{0}': expected key=value")]
pub struct OptionParseError(pub String);

/// Options handed to every task hook.
///
/// Keys are kept ordered so log output and usage listings are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOptions {
    values: BTreeMap<String, String>,
}

impl TaskOptions {
    /// Create an empty option set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse options from `key=value` pairs.
    ///
    /// A later pair overrides an earlier one with the same key.
    ///
    /// # Errors
    ///
    /// Returns [`OptionParseError`] for a pair without `=` or with an empty
    /// key.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, OptionParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = Self::new();
        for pair in pairs {
            let pair = pair.as_ref();
            match pair.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    options.insert(key.trim(), value);
                },
                _ => return Err(OptionParseError(pair.to_string())),
            }
        }
        Ok(options)
    }

    /// Insert or replace an option.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Look up a raw option value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Look up an option and parse it. Returns `None` when the key is missing
    /// or the value does not parse.
    #[must_use]
    pub fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|value| value.trim().parse().ok())
    }

    /// Whether the option is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

/// Pool settings a task may adjust inside the daemon before workers start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Number of worker processes the supervisor keeps alive.
    pub workers: usize,
}

/// Result of one successful work-unit invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep iterating.
    Continue,
    /// End this worker. The supervisor replaces it unless shutting down.
    Stop,
}

/// The contract a concrete task supplies.
///
/// Only [`MonitoredTask::work`] is required; the remaining hooks default to
/// no-ops.
pub trait MonitoredTask {
    /// Failure raised by a work unit. Logged by the worker loop.
    type Error: fmt::Display;

    /// Validate options before `start` or `restart`.
    fn validate(&self, _options: &TaskOptions) -> bool {
        true
    }

    /// One-time preparation inside the daemon process, before its standard
    /// streams are redirected and before the pool starts.
    fn set_up(&mut self, _options: &mut TaskOptions, _settings: &mut PoolSettings) {}

    /// One-time initialization inside every freshly forked worker.
    fn init(&mut self, _options: &TaskOptions) {}

    /// Execute one unit of work.
    ///
    /// # Errors
    ///
    /// An error ends the current worker after the failure backoff.
    fn work(&mut self, options: &TaskOptions) -> Result<Flow, Self::Error>;

    /// Stem of the registry file. Defaults to the name with separators
    /// replaced by `-`.
    fn pid_file_name(&self, name: &TaskName) -> String {
        name.pid_file_stem()
    }
}
