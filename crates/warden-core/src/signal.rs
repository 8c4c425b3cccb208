//! Signal handling for supervisor and worker processes.
//!
//! The asynchronous handler does nothing but flip atomics: the process-wide
//! [`ShutdownFlag`] and a per-signal "pending" marker. Everything else happens
//! in [`SignalDispatcher::dispatch`], called at loop boundaries, which drains
//! the pending markers and, in a supervisor, forwards each received signal to
//! every worker of the pool snapshot.
//!
//! Registrations are plain `signal-hook` flag actions, so no helper thread is
//! started and the process stays safe to `fork`.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use signal_hook::SigId;
use tracing::{info, warn};

use crate::pool::WorkerPool;

/// Signals that request a shutdown.
pub const HANDLED_SIGNALS: [Signal; 6] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGUSR1,
    Signal::SIGTSTP,
    Signal::SIGTTOU,
];

/// Process-local shutdown request.
///
/// Moves from `false` to `true` exactly once and is never reset.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    /// A flag that has not been raised.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether shutdown was requested.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Raise the flag. Returns `true` only for the call that raised it.
    pub fn request(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    fn handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Which side of the fork a process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The daemon that owns the worker pool.
    Supervisor,
    /// A forked process running the work loop.
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Supervisor => f.write_str("supervisor"),
            Self::Worker => f.write_str("worker"),
        }
    }
}

/// Signal handler registration failure.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// `signal-hook` refused the registration.
    #[error("failed to install handler for {signal}: {source}")]
    Install {
        /// The signal being registered.
        signal: Signal,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
struct PendingSignal {
    signal: Signal,
    pending: Arc<AtomicBool>,
}

/// Installed handlers plus the state needed to act on them.
#[derive(Debug)]
pub struct SignalDispatcher {
    role: Role,
    shutdown: ShutdownFlag,
    pending: Vec<PendingSignal>,
    ids: Vec<SigId>,
}

impl SignalDispatcher {
    /// Register handlers for [`HANDLED_SIGNALS`] in the calling process.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Install`] if a registration fails. Handlers
    /// registered before the failure are removed again.
    pub fn install(role: Role, shutdown: ShutdownFlag) -> Result<Self, SignalError> {
        let mut signals = HANDLED_SIGNALS.to_vec();
        signals.sort_by_key(|signal| *signal as i32);
        signals.dedup();

        let mut dispatcher = Self {
            role,
            shutdown,
            pending: Vec::with_capacity(signals.len()),
            ids: Vec::with_capacity(signals.len() * 2),
        };
        for signal in signals {
            let pending = Arc::new(AtomicBool::new(false));
            let raw = signal as i32;
            let registered = signal_hook::flag::register(raw, dispatcher.shutdown.handle())
                .and_then(|shutdown_id| {
                    dispatcher.ids.push(shutdown_id);
                    signal_hook::flag::register(raw, Arc::clone(&pending))
                });
            match registered {
                Ok(id) => dispatcher.ids.push(id),
                // Drop unregisters what was installed so far.
                Err(source) => return Err(SignalError::Install { signal, source }),
            }
            dispatcher.pending.push(PendingSignal { signal, pending });
        }
        Ok(dispatcher)
    }

    /// Replace the registrations inherited across `fork` with fresh ones for a
    /// worker. The shutdown flag is carried over so a signal that arrived
    /// between the fork and this call is not lost.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Install`] if a registration fails.
    pub fn for_worker(&self) -> Result<Self, SignalError> {
        self.uninstall();
        Self::install(Role::Worker, self.shutdown.clone())
    }

    /// The role this dispatcher acts for.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// The shutdown flag raised by the handlers.
    #[must_use]
    pub const fn shutdown(&self) -> &ShutdownFlag {
        &self.shutdown
    }

    /// Drain pending signals and act on them.
    ///
    /// Every drained signal raises the shutdown flag. A supervisor then sends
    /// the same signal to every pid in `workers`; a failed send is logged and
    /// the remaining workers are still signalled. Returns the drained signals.
    pub fn dispatch(&self, workers: &WorkerPool) -> Vec<Signal> {
        let fired: Vec<Signal> = self
            .pending
            .iter()
            .filter(|slot| slot.pending.swap(false, Ordering::SeqCst))
            .map(|slot| slot.signal)
            .collect();

        for &signal in &fired {
            self.shutdown.request();
            info!(%signal, role = %self.role, "shutdown requested");
            if self.role == Role::Supervisor {
                for pid in workers.iter() {
                    if let Err(errno) = kill(pid, signal) {
                        warn!(%pid, %signal, %errno, "failed to forward signal to worker");
                    }
                }
            }
        }
        fired
    }

    fn uninstall(&self) {
        for id in &self.ids {
            signal_hook::low_level::unregister(*id);
        }
    }
}

impl Drop for SignalDispatcher {
    fn drop(&mut self) {
        self.uninstall();
    }
}
