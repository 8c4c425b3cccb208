//! Worker pool supervisor.
//!
//! Runs inside the daemon process and keeps a fixed number of worker
//! processes alive:
//!
//! - **Fill and reap** (until shutdown): fork workers while the pool is below
//!   its target size, reap one exited worker without blocking, sleep one poll
//!   interval.
//! - **Drain** (after shutdown): reap without blocking until the pool is
//!   empty, sleeping one poll interval whenever nothing exited.
//!
//! Process creation and reaping go through [`WorkerLauncher`]; the production
//! implementation is [`ForkLauncher`].

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};
use tracing::{error, info, info_span, warn};

use crate::config::Timings;
use crate::signal::{ShutdownFlag, SignalDispatcher};
use crate::task::{MonitoredTask, PoolSettings, TaskOptions};
use crate::worker::ExecuteLoop;

/// Process-control failures inside the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// `fork` failed.
    #[error("failed to fork worker: {0}")]
    Fork(#[source] Errno),

    /// `waitpid` failed for a reason other than "no children".
    #[error("failed to reap workers: {0}")]
    Reap(#[source] Errno),
}

/// The live worker pids, owned by the supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerPool {
    workers: HashSet<Pid>,
}

impl WorkerPool {
    /// An empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly forked worker.
    pub fn insert(&mut self, pid: Pid) -> bool {
        self.workers.insert(pid)
    }

    /// Forget a reaped worker.
    pub fn remove(&mut self, pid: Pid) -> bool {
        self.workers.remove(&pid)
    }

    /// Whether `pid` is tracked.
    #[must_use]
    pub fn contains(&self, pid: Pid) -> bool {
        self.workers.contains(&pid)
    }

    /// Number of tracked workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether no worker is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Iterate over tracked pids (unordered).
    pub fn iter(&self) -> impl Iterator<Item = Pid> + '_ {
        self.workers.iter().copied()
    }

    fn clear(&mut self) {
        self.workers.clear();
    }
}

/// Result of one non-blocking reap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reap {
    /// A child changed state.
    Exited(WaitStatus),
    /// Children exist but none has exited.
    Pending,
    /// The process has no children at all.
    NoChildren,
}

/// Creates and reaps worker processes.
pub trait WorkerLauncher {
    /// Start one worker and return its pid. Only returns in the supervisor.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Fork`] if the worker could not be created.
    fn launch(&mut self) -> Result<Pid, PoolError>;

    /// Reap at most one exited worker without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Reap`] on an unexpected wait failure.
    fn reap(&mut self) -> Result<Reap, PoolError>;
}

/// Production launcher: forks the current process and runs the execute loop
/// in the child.
pub struct ForkLauncher<'a, T> {
    task: &'a mut T,
    options: &'a TaskOptions,
    timings: Timings,
    shutdown: ShutdownFlag,
    signals: Option<&'a SignalDispatcher>,
}

impl<'a, T: MonitoredTask> ForkLauncher<'a, T> {
    /// Create a launcher for `task`. Children observe `shutdown`.
    pub fn new(
        task: &'a mut T,
        options: &'a TaskOptions,
        timings: Timings,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            task,
            options,
            timings,
            shutdown,
            signals: None,
        }
    }

    /// Supervisor registrations that each child replaces with its own.
    #[must_use]
    pub fn with_signals(mut self, signals: &'a SignalDispatcher) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Body of a forked worker. Never returns.
    fn run_child(&mut self) -> ! {
        let span = info_span!("worker", pid = %getpid());
        let _guard = span.enter();

        let own_signals = match self.signals.map(SignalDispatcher::for_worker).transpose() {
            Ok(signals) => signals,
            Err(e) => {
                warn!(error = %e, "worker runs without its own signal handlers");
                None
            },
        };
        let shutdown = own_signals
            .as_ref()
            .map_or_else(|| self.shutdown.clone(), |s| s.shutdown().clone());

        info!("worker started");
        self.task.init(self.options);

        let mut execute = ExecuteLoop::new(&self.timings, &shutdown);
        if let Some(signals) = own_signals.as_ref() {
            execute = execute.with_signals(signals);
        }
        let exit = execute.run(self.task, self.options);

        info!(?exit, "worker exiting");
        thread::sleep(self.timings.exit_pause);
        std::process::exit(0)
    }
}

impl<T: MonitoredTask> WorkerLauncher for ForkLauncher<'_, T> {
    #[allow(unsafe_code)] // fork() requires unsafe
    fn launch(&mut self) -> Result<Pid, PoolError> {
        // SAFETY: the supervisor is single-threaded: no async runtime exists
        // and signal handling is done with flag registrations only. The child
        // never returns from `run_child`.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => Ok(child),
            Ok(ForkResult::Child) => self.run_child(),
            Err(errno) => Err(PoolError::Fork(errno)),
        }
    }

    fn reap(&mut self) -> Result<Reap, PoolError> {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(Reap::Pending),
            Ok(status) => Ok(Reap::Exited(status)),
            Err(Errno::ECHILD) => Ok(Reap::NoChildren),
            Err(Errno::EINTR) => Ok(Reap::Pending),
            Err(errno) => Err(PoolError::Reap(errno)),
        }
    }
}

/// Keeps `workers` processes alive until shutdown, then drains them.
pub struct Supervisor<'s, L> {
    launcher: L,
    pool: WorkerPool,
    workers: usize,
    poll_interval: Duration,
    shutdown: ShutdownFlag,
    signals: Option<&'s SignalDispatcher>,
}

impl<'s, L: WorkerLauncher> Supervisor<'s, L> {
    /// Create a supervisor with an empty pool.
    pub fn new(
        launcher: L,
        settings: PoolSettings,
        poll_interval: Duration,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            launcher,
            pool: WorkerPool::new(),
            workers: settings.workers,
            poll_interval,
            shutdown,
            signals: None,
        }
    }

    /// Drain and forward signals through `signals` at every loop boundary.
    #[must_use]
    pub const fn with_signals(mut self, signals: &'s SignalDispatcher) -> Self {
        self.signals = Some(signals);
        self
    }

    /// The current pool.
    #[must_use]
    pub const fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Run both phases to completion. Returns once shutdown was requested and
    /// every worker has been reaped.
    pub fn run(&mut self) {
        info!(workers = self.workers, "supervisor started");
        loop {
            self.dispatch_signals();
            if self.shutdown.is_set() {
                break;
            }
            self.fill();
            self.reap_once();
            thread::sleep(self.poll_interval);
        }

        info!(remaining = self.pool.len(), "draining workers");
        loop {
            self.dispatch_signals();
            if self.pool.is_empty() {
                break;
            }
            if !self.reap_once() {
                thread::sleep(self.poll_interval);
            }
        }
        info!("supervisor stopped");
    }

    /// Fork workers until the pool reaches its target size. Refuses to fork
    /// once shutdown was requested; stops early on a fork failure. Returns the
    /// number of workers started.
    pub fn fill(&mut self) -> usize {
        let mut started = 0;
        while self.pool.len() < self.workers && !self.shutdown.is_set() {
            match self.launcher.launch() {
                Ok(pid) => {
                    self.pool.insert(pid);
                    started += 1;
                    info!(%pid, live = self.pool.len(), "worker forked");
                },
                Err(e) => {
                    error!(error = %e, "worker fork failed; retrying next cycle");
                    break;
                },
            }
        }
        started
    }

    /// One non-blocking reap. Returns whether a worker was removed.
    pub fn reap_once(&mut self) -> bool {
        match self.launcher.reap() {
            Ok(Reap::Exited(status)) => match status.pid() {
                Some(pid) if self.pool.remove(pid) => {
                    info!(%pid, ?status, live = self.pool.len(), "worker exited");
                    true
                },
                Some(pid) => {
                    warn!(%pid, ?status, "reaped an untracked child");
                    false
                },
                None => false,
            },
            Ok(Reap::Pending) => false,
            Ok(Reap::NoChildren) => {
                if self.pool.is_empty() {
                    return false;
                }
                warn!(
                    tracked = self.pool.len(),
                    "no child processes left; clearing worker pool"
                );
                self.pool.clear();
                true
            },
            Err(e) => {
                error!(error = %e, "reap failed");
                false
            },
        }
    }

    fn dispatch_signals(&self) {
        if let Some(signals) = self.signals {
            signals.dispatch(&self.pool);
        }
    }
}
