//! `heartbeat`: logs a tick from every worker at a fixed interval.

use std::thread;
use std::time::Duration;

use tracing::info;
use warden_core::{Flow, MonitoredTask, PoolSettings, TaskOptions};

use super::{apply_workers_option, optional_u64_is_valid};

pub const OPTIONS_HELP: &str = "  interval_ms=MS    pause between ticks (default 1000)\n  \
                                limit=N          ticks before a worker stops (default: none)\n";

const DEFAULT_INTERVAL_MS: u64 = 1000;

/// Tick counter, reset in every worker.
#[derive(Debug, Default)]
pub struct Heartbeat {
    ticks: u64,
}

impl MonitoredTask for Heartbeat {
    type Error = anyhow::Error;

    fn validate(&self, options: &TaskOptions) -> bool {
        optional_u64_is_valid(options, "interval_ms")
            && (!options.contains("limit") || options.parse::<u64>("limit").is_some_and(|n| n > 0))
    }

    fn set_up(&mut self, options: &mut TaskOptions, settings: &mut PoolSettings) {
        apply_workers_option(options, settings);
    }

    fn init(&mut self, _options: &TaskOptions) {
        self.ticks = 0;
    }

    fn work(&mut self, options: &TaskOptions) -> Result<Flow, Self::Error> {
        self.ticks += 1;
        info!(tick = self.ticks, "heartbeat");

        if options
            .parse::<u64>("limit")
            .is_some_and(|limit| self.ticks >= limit)
        {
            return Ok(Flow::Stop);
        }
        let interval = options
            .parse::<u64>("interval_ms")
            .unwrap_or(DEFAULT_INTERVAL_MS);
        thread::sleep(Duration::from_millis(interval));
        Ok(Flow::Continue)
    }
}
