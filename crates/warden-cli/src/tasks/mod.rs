//! Built-in tasks runnable through `warden <task> <operation>`.

use clap::ValueEnum;
use tracing::warn;
use warden_core::{PoolSettings, TaskName, TaskOptions};

pub mod exec;
pub mod heartbeat;

pub use exec::Exec;
pub use heartbeat::Heartbeat;

/// Task selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TaskKind {
    /// Log a tick at a fixed interval
    Heartbeat,
    /// Run a shell command repeatedly
    Exec,
}

impl TaskKind {
    /// Registered task name; derives the pid and log file names.
    pub fn name(self) -> TaskName {
        match self {
            Self::Heartbeat => TaskName::new("warden:heartbeat"),
            Self::Exec => TaskName::new("warden:exec"),
        }
    }

    /// Usage printed by `help` and when options are rejected.
    pub fn usage(self) -> String {
        let (cli, options) = match self {
            Self::Heartbeat => ("heartbeat", heartbeat::OPTIONS_HELP),
            Self::Exec => ("exec", exec::OPTIONS_HELP),
        };
        format!(
            "usage: warden {cli} <start|stop|restart|status|help> [-o KEY=VALUE]...\n\n\
             options:\n{options}  workers=N        worker processes (overrides pool.workers)\n"
        )
    }
}

/// Shared set-up hook: `workers=N` resizes the pool.
pub fn apply_workers_option(options: &TaskOptions, settings: &mut PoolSettings) {
    if !options.contains("workers") {
        return;
    }
    match options.parse::<usize>("workers") {
        Some(workers) if workers > 0 => settings.workers = workers,
        _ => warn!(
            value = options.get("workers").unwrap_or_default(),
            "ignoring invalid workers option"
        ),
    }
}

/// Optional numeric option: absent is fine, present must parse.
pub fn optional_u64_is_valid(options: &TaskOptions, key: &str) -> bool {
    !options.contains(key) || options.parse::<u64>(key).is_some()
}
