//! `exec`: runs a shell command in every worker, over and over.
//!
//! A zero exit status continues the loop. Anything else is a work-unit
//! failure, which ends the worker; the supervisor forks a replacement.

use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::debug;
use warden_core::{Flow, MonitoredTask, PoolSettings, TaskOptions};

use super::{apply_workers_option, optional_u64_is_valid};

pub const OPTIONS_HELP: &str = "  command=CMD      shell command to run (required)\n  \
                                pause_ms=MS      pause between runs (default 1000)\n";

const DEFAULT_PAUSE_MS: u64 = 1000;

/// Stateless; everything comes from the options.
#[derive(Debug, Default)]
pub struct Exec;

impl MonitoredTask for Exec {
    type Error = anyhow::Error;

    fn validate(&self, options: &TaskOptions) -> bool {
        options.get("command").is_some_and(|c| !c.trim().is_empty())
            && optional_u64_is_valid(options, "pause_ms")
    }

    fn set_up(&mut self, options: &mut TaskOptions, settings: &mut PoolSettings) {
        apply_workers_option(options, settings);
    }

    fn work(&mut self, options: &TaskOptions) -> Result<Flow, Self::Error> {
        let Some(command) = options.get("command") else {
            bail!("missing command option");
        };
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .status()
            .with_context(|| format!("failed to run '{command}'"))?;
        if !status.success() {
            bail!("'{command}' exited with {status}");
        }
        debug!(command, "command finished");

        let pause = options.parse::<u64>("pause_ms").unwrap_or(DEFAULT_PAUSE_MS);
        thread::sleep(Duration::from_millis(pause));
        Ok(Flow::Continue)
    }
}
