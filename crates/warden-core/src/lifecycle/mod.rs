//! Lifecycle controller: `start`, `stop`, `restart`, `status`, `help`.
//!
//! The controller runs in the short-lived command process. `start` forks the
//! daemon and records its pid in the task's registry file; `stop` deletes that
//! file and terminates every recorded supervisor, whose own signal handling
//! cascades the shutdown to its workers.

mod daemon;
mod process;

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;
use std::thread;

use nix::errno::Errno;
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, error, info};

pub use self::daemon::{redirect_std_streams, run_pool};
pub use self::process::{OsProcessControl, ProcessControl, WaitOutcome};
use crate::config::WardenConfig;
use crate::registry::{Registry, RegistryError};
use crate::signal::SignalError;
use crate::task::{MonitoredTask, TaskName, TaskOptions};

/// Sub-command handled by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operation {
    /// Daemonize and run the worker pool.
    Start,
    /// Terminate recorded supervisors.
    Stop,
    /// Stop, wait the grace period, start.
    Restart,
    /// Print recorded supervisors.
    #[default]
    Status,
    /// Print usage.
    Help,
}

impl Operation {
    /// Parse a sub-command, falling back to [`Operation::Status`] for anything
    /// missing or unrecognized. Only the exact lowercase words match.
    #[must_use]
    pub fn parse_or_status(value: Option<&str>) -> Self {
        value.and_then(|v| v.parse().ok()).unwrap_or_default()
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "status" => Ok(Self::Status),
            "help" => Ok(Self::Help),
            other => Err(format!("unknown operation '{other}'")),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Status => "status",
            Self::Help => "help",
        })
    }
}

/// Result of a completed operation, mapped to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Exit 0.
    Success,
    /// Exit 1.
    Failure,
}

impl CommandOutcome {
    /// The process exit code.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
        }
    }
}

/// Errors surfaced by the controller.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// Options were rejected before `restart`.
    #[error("invalid options for {0}")]
    InvalidOptions(TaskName),

    /// Registry file access failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Signal handlers could not be installed.
    #[error(transparent)]
    Signal(#[from] SignalError),

    /// Forking the daemon failed.
    #[error("failed to fork daemon: {0}")]
    Fork(#[source] Errno),

    /// Writing user-facing output failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

/// Dispatches lifecycle operations for one task.
pub struct Controller<T, P = OsProcessControl> {
    task: T,
    name: TaskName,
    config: WardenConfig,
    registry: Registry,
    usage: String,
    control: P,
}

impl<T: MonitoredTask> Controller<T> {
    /// Create a controller for `task` registered under `name`.
    pub fn new(task: T, name: TaskName, config: WardenConfig) -> Self {
        let registry = Registry::new(config.paths.registry_file(&task.pid_file_name(&name)));
        let usage = format!("usage: {name} <start|stop|restart|status|help>");
        Self {
            task,
            name,
            config,
            registry,
            usage,
            control: OsProcessControl,
        }
    }
}

impl<T: MonitoredTask, P: ProcessControl> Controller<T, P> {
    /// Replace the usage text printed by `help` and on invalid options.
    #[must_use]
    pub fn with_usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = usage.into();
        self
    }

    /// Replace how `stop` signals and waits on supervisors.
    pub fn with_process_control<Q: ProcessControl>(self, control: Q) -> Controller<T, Q> {
        Controller {
            task: self.task,
            name: self.name,
            config: self.config,
            registry: self.registry,
            usage: self.usage,
            control,
        }
    }

    /// The task's registry.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The task's name.
    #[must_use]
    pub const fn name(&self) -> &TaskName {
        &self.name
    }

    /// Run `operation`, writing user-facing lines to `out`.
    ///
    /// A successful `start` or `restart` does not return: the command process
    /// exits 0 once the daemon's pid is recorded.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidOptions`] when `restart` options are
    /// rejected, and any registry, fork, or output error.
    pub fn run(
        &mut self,
        operation: Operation,
        options: TaskOptions,
        out: &mut dyn Write,
    ) -> Result<CommandOutcome, LifecycleError> {
        debug!(task = %self.name, %operation, "dispatching");
        match operation {
            Operation::Start => self.start(options, out),
            Operation::Stop => self.stop(out),
            Operation::Restart => self.restart(options, out),
            Operation::Status => self.status(out),
            Operation::Help => self.help(out),
        }
    }

    /// Validate, then daemonize unless the registry file already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read, output cannot be
    /// written, or the fork fails.
    pub fn start(
        &mut self,
        options: TaskOptions,
        out: &mut dyn Write,
    ) -> Result<CommandOutcome, LifecycleError> {
        if !self.task.validate(&options) {
            self.help(out)?;
            return Ok(CommandOutcome::Failure);
        }
        if self.registry.exists() {
            return self.status(out);
        }
        self.spawn_daemon(options, out)
    }

    /// Delete the registry file and terminate every recorded supervisor.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read or removed, or output
    /// cannot be written. A failed signal is reported and does not abort the
    /// remaining pids.
    pub fn stop(&mut self, out: &mut dyn Write) -> Result<CommandOutcome, LifecycleError> {
        let Some(pids) = self.registry.take()? else {
            writeln!(out, "{} is not running", self.name)?;
            return Ok(CommandOutcome::Success);
        };

        let timing = self.config.timing;
        for pid in pids {
            match self.control.terminate(pid) {
                Ok(()) => {
                    info!(task = %self.name, %pid, "sent SIGTERM to supervisor");
                    if self.control.wait_for_exit(pid, timing.poll_interval, timing.stop_timeout)
                        == WaitOutcome::TimedOut
                    {
                        writeln!(
                            out,
                            "{} ({pid}) is still running after {:?}",
                            self.name, timing.stop_timeout
                        )?;
                    }
                },
                Err(errno) => {
                    error!(task = %self.name, %pid, %errno, "failed to signal supervisor");
                    writeln!(
                        out,
                        "Cannot stop {} ({pid}): {errno}, please kill it manually.",
                        self.name
                    )?;
                },
            }
        }
        Ok(CommandOutcome::Success)
    }

    /// Validate, stop, wait the restart grace period, start.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidOptions`] when options are rejected;
    /// the caller is expected to exit non-zero immediately.
    pub fn restart(
        &mut self,
        options: TaskOptions,
        out: &mut dyn Write,
    ) -> Result<CommandOutcome, LifecycleError> {
        if !self.task.validate(&options) {
            self.help(out)?;
            return Err(LifecycleError::InvalidOptions(self.name.clone()));
        }
        self.stop(out)?;
        thread::sleep(self.config.timing.restart_grace);
        self.start(options, out)
    }

    /// Print every recorded supervisor pid, or that the task is not running.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read or output cannot be
    /// written.
    pub fn status(&self, out: &mut dyn Write) -> Result<CommandOutcome, LifecycleError> {
        let pids = self.registry.read()?;
        if pids.is_empty() {
            writeln!(out, "{} is not running", self.name)?;
        } else {
            writeln!(out, "{} process:", self.name)?;
            for pid in pids {
                writeln!(out, "  |-- {pid} is Running")?;
            }
        }
        Ok(CommandOutcome::Success)
    }

    /// Print usage.
    ///
    /// # Errors
    ///
    /// Returns an error if output cannot be written.
    pub fn help(&self, out: &mut dyn Write) -> Result<CommandOutcome, LifecycleError> {
        writeln!(out, "{}", self.usage.trim_end())?;
        Ok(CommandOutcome::Success)
    }

    #[allow(unsafe_code)] // fork() requires unsafe
    fn spawn_daemon(
        &mut self,
        options: TaskOptions,
        out: &mut dyn Write,
    ) -> Result<CommandOutcome, LifecycleError> {
        out.flush()?;
        io::stdout().flush()?;

        // SAFETY: the command process is single-threaded (no async runtime, no
        // helper threads); the child only returns through `process::exit`.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => self.record_and_exit(child),
            Ok(ForkResult::Child) => {
                daemon::daemon_main(&mut self.task, &self.name, &self.config, options)
            },
            Err(errno) => Err(LifecycleError::Fork(errno)),
        }
    }

    fn record_and_exit(&self, child: Pid) -> ! {
        match self.registry.append(child) {
            Ok(()) => {
                info!(task = %self.name, pid = %child, "daemon started");
                std::process::exit(0)
            },
            Err(e) => {
                error!(
                    task = %self.name,
                    pid = %child,
                    error = %e,
                    "daemon started but its pid was not recorded; stop it manually"
                );
                std::process::exit(1)
            },
        }
    }
}
