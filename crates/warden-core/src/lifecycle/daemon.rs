//! The detached supervisor process.
//!
//! After `start` forks, the child becomes the daemon: it leaves the
//! controlling terminal, lets the task prepare itself, points its standard
//! streams at `/dev/null` and the task log, and runs the worker pool until a
//! shutdown signal has drained it.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

use nix::libc::{STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{dup2, setsid};
use tracing::{error, info, warn};

use super::LifecycleError;
use crate::config::{Timings, WardenConfig};
use crate::pool::{ForkLauncher, Supervisor};
use crate::signal::{Role, ShutdownFlag, SignalDispatcher};
use crate::task::{MonitoredTask, PoolSettings, TaskName, TaskOptions};

/// Body of the forked daemon. Never returns.
pub(super) fn daemon_main<T: MonitoredTask>(
    task: &mut T,
    name: &TaskName,
    config: &WardenConfig,
    mut options: TaskOptions,
) -> ! {
    umask(Mode::empty());
    if let Err(errno) = setsid() {
        error!(task = %name, %errno, "could not detach session");
        std::process::exit(1);
    }

    let mut settings = config.pool_settings();
    task.set_up(&mut options, &mut settings);
    if settings.workers == 0 {
        warn!(task = %name, "set-up hook requested zero workers; using one");
        settings.workers = 1;
    }

    let log_file = config.paths.log_file(name);
    if let Err(e) = redirect_std_streams(&log_file) {
        error!(task = %name, log = %log_file.display(), error = %e, "could not redirect output");
        std::process::exit(1);
    }

    info!(task = %name, pid = %nix::unistd::getpid(), workers = settings.workers, "daemon started");
    let code = match run_pool(task, &options, settings, config.timing) {
        Ok(()) => 0,
        Err(e) => {
            error!(task = %name, error = %e, "supervisor failed");
            1
        },
    };
    std::process::exit(code)
}

/// Install supervisor signal handling and run the worker pool in the calling
/// process until shutdown has drained every worker.
///
/// # Errors
///
/// Returns [`LifecycleError::Signal`] if the handlers cannot be installed.
pub fn run_pool<T: MonitoredTask>(
    task: &mut T,
    options: &TaskOptions,
    settings: PoolSettings,
    timings: Timings,
) -> Result<(), LifecycleError> {
    let shutdown = ShutdownFlag::new();
    let signals = SignalDispatcher::install(Role::Supervisor, shutdown.clone())?;
    let launcher = ForkLauncher::new(task, options, timings, shutdown.clone()).with_signals(&signals);
    Supervisor::new(launcher, settings, timings.poll_interval, shutdown)
        .with_signals(&signals)
        .run();
    Ok(())
}

/// Point stdin at `/dev/null` and stdout/stderr at `log_file`, opened for
/// appending and created when missing.
///
/// # Errors
///
/// Returns an error if a file cannot be opened or a descriptor duplicated.
pub fn redirect_std_streams(log_file: &Path) -> io::Result<()> {
    if let Some(dir) = log_file.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let null = File::open("/dev/null")?;
    let log = OpenOptions::new().create(true).append(true).open(log_file)?;

    dup2(null.as_raw_fd(), STDIN_FILENO)?;
    dup2(log.as_raw_fd(), STDOUT_FILENO)?;
    dup2(log.as_raw_fd(), STDERR_FILENO)?;
    Ok(())
}
