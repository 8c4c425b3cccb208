//! warden - run a repeatable task as a supervised pool of worker processes.

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use warden_core::{
    Controller, LifecycleError, MonitoredTask, Operation, TaskOptions, WardenConfig,
};

mod tasks;

use tasks::{Exec, Heartbeat, TaskKind};

/// warden - supervisor for forked worker pools
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "warden.toml")]
    config: PathBuf,

    /// Log filter (e.g. `info`, `warden_core=debug`)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Task to control
    #[arg(value_enum)]
    task: TaskKind,

    /// start, stop, restart, status or help (anything else is status)
    operation: Option<String>,

    /// Task option, repeatable
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    options: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so status output on stdout stays clean. The daemon
    // later points stderr at the task log.
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(false),
        )
        .init();

    let config = WardenConfig::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    let options = TaskOptions::from_pairs(&cli.options)?;
    let operation = Operation::parse_or_status(cli.operation.as_deref());

    let result = match cli.task {
        TaskKind::Heartbeat => run(Heartbeat::default(), cli.task, config, operation, options),
        TaskKind::Exec => run(Exec, cli.task, config, operation, options),
    };

    match result {
        Ok(outcome) => std::process::exit(outcome.exit_code()),
        // Usage has already been printed.
        Err(LifecycleError::InvalidOptions(_)) => std::process::exit(1),
        Err(e) => Err(e).with_context(|| format!("{operation} {} failed", cli.task.name())),
    }
}

fn run<T: MonitoredTask>(
    task: T,
    kind: TaskKind,
    config: WardenConfig,
    operation: Operation,
    options: TaskOptions,
) -> Result<warden_core::CommandOutcome, LifecycleError> {
    let mut controller = Controller::new(task, kind.name(), config).with_usage(kind.usage());
    controller.run(operation, options, &mut io::stdout())
}
