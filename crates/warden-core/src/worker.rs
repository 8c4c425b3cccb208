//! Worker execute loop.
//!
//! Runs inside every worker process. The loop calls the task's work unit until
//! one of three things happens: the shutdown flag is raised, the work unit
//! returns [`Flow::Stop`], or the work unit fails. Failures (returned errors
//! and panics alike) are logged and followed by the failure backoff; they end
//! the worker, and the supervisor forks a replacement on its next cycle.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use tracing::{debug, error};

use crate::config::Timings;
use crate::pool::WorkerPool;
use crate::signal::{ShutdownFlag, SignalDispatcher};
use crate::task::{Flow, MonitoredTask, TaskOptions};

/// Why a worker's execute loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The shutdown flag was observed at an iteration boundary.
    Shutdown,
    /// The work unit returned [`Flow::Stop`].
    Stopped,
    /// The work unit failed.
    Failed,
}

/// Outcome of a single guarded work-unit call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Iterate again.
    Continue,
    /// Stop sentinel.
    Stop,
    /// Returned error or panic, with its message.
    Failed(String),
}

/// Everything the loop needs besides the task itself.
#[derive(Debug, Clone, Copy)]
pub struct ExecuteLoop<'a> {
    timings: &'a Timings,
    shutdown: &'a ShutdownFlag,
    signals: Option<&'a SignalDispatcher>,
}

impl<'a> ExecuteLoop<'a> {
    /// Create a loop observing `shutdown`.
    #[must_use]
    pub const fn new(timings: &'a Timings, shutdown: &'a ShutdownFlag) -> Self {
        Self {
            timings,
            shutdown,
            signals: None,
        }
    }

    /// Drain this dispatcher at every iteration boundary.
    #[must_use]
    pub const fn with_signals(mut self, signals: &'a SignalDispatcher) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Run the work unit until shutdown, stop, or failure.
    pub fn run<T: MonitoredTask>(&self, task: &mut T, options: &TaskOptions) -> LoopExit {
        let mut iterations: u64 = 0;
        let exit = loop {
            if let Some(signals) = self.signals {
                signals.dispatch(&WorkerPool::new());
            }
            if self.shutdown.is_set() {
                break LoopExit::Shutdown;
            }

            iterations += 1;
            match invoke(task, options) {
                UnitOutcome::Continue => thread::sleep(self.timings.iteration_pause),
                UnitOutcome::Stop => break LoopExit::Stopped,
                UnitOutcome::Failed(message) => {
                    error!(iteration = iterations, error = %message, "work unit failed");
                    thread::sleep(self.timings.failure_backoff);
                    break LoopExit::Failed;
                },
            }
        };
        debug!(?exit, iterations, "execute loop finished");
        exit
    }
}

/// Call the work unit once, converting errors and panics into
/// [`UnitOutcome::Failed`].
pub fn invoke<T: MonitoredTask>(task: &mut T, options: &TaskOptions) -> UnitOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| task.work(options))) {
        Ok(Ok(Flow::Continue)) => UnitOutcome::Continue,
        Ok(Ok(Flow::Stop)) => UnitOutcome::Stop,
        Ok(Err(e)) => UnitOutcome::Failed(e.to_string()),
        Err(payload) => UnitOutcome::Failed(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "work unit panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn fast_timings() -> Timings {
        Timings {
            poll_interval: Duration::from_millis(1),
            failure_backoff: Duration::from_millis(30),
            iteration_pause: Duration::from_micros(10),
            exit_pause: Duration::ZERO,
            restart_grace: Duration::ZERO,
            stop_timeout: Duration::from_millis(10),
        }
    }

    /// Returns `Stop` on invocation `stop_at`, fails when `fail` is set.
    struct Scripted {
        calls: u32,
        stop_at: Option<u32>,
        fail: bool,
        raise_at: Option<(u32, ShutdownFlag)>,
    }

    impl Scripted {
        fn new() -> Self {
            Self {
                calls: 0,
                stop_at: None,
                fail: false,
                raise_at: None,
            }
        }
    }

    impl MonitoredTask for Scripted {
        type Error = String;

        fn work(&mut self, _options: &TaskOptions) -> Result<Flow, String> {
            self.calls += 1;
            if let Some((at, flag)) = &self.raise_at {
                if *at == self.calls {
                    flag.request();
                }
            }
            if self.fail {
                return Err(format!("boom #{}", self.calls));
            }
            if self.stop_at == Some(self.calls) {
                return Ok(Flow::Stop);
            }
            Ok(Flow::Continue)
        }
    }

    struct Panicky;

    impl MonitoredTask for Panicky {
        type Error = String;

        fn work(&mut self, _options: &TaskOptions) -> Result<Flow, String> {
            panic!("lost connection");
        }
    }

    #[test]
    fn test_stop_sentinel_on_third_call() {
        let timings = fast_timings();
        let shutdown = ShutdownFlag::new();
        let mut task = Scripted::new();
        task.stop_at = Some(3);

        let exit = ExecuteLoop::new(&timings, &shutdown).run(&mut task, &TaskOptions::new());
        assert_eq!(exit, LoopExit::Stopped);
        assert_eq!(task.calls, 3);
    }

    #[test]
    fn test_failure_ends_worker_after_backoff() {
        let timings = fast_timings();
        let shutdown = ShutdownFlag::new();
        let mut task = Scripted::new();
        task.fail = true;

        let started = Instant::now();
        let exit = ExecuteLoop::new(&timings, &shutdown).run(&mut task, &TaskOptions::new());
        assert_eq!(exit, LoopExit::Failed);
        assert_eq!(task.calls, 1);
        assert!(started.elapsed() >= timings.failure_backoff);
    }

    #[test]
    fn test_shutdown_before_first_call() {
        let timings = fast_timings();
        let shutdown = ShutdownFlag::new();
        shutdown.request();
        let mut task = Scripted::new();

        let exit = ExecuteLoop::new(&timings, &shutdown).run(&mut task, &TaskOptions::new());
        assert_eq!(exit, LoopExit::Shutdown);
        assert_eq!(task.calls, 0);
    }

    #[test]
    fn test_shutdown_observed_at_next_boundary() {
        let timings = fast_timings();
        let shutdown = ShutdownFlag::new();
        let mut task = Scripted::new();
        task.raise_at = Some((2, shutdown.clone()));

        let exit = ExecuteLoop::new(&timings, &shutdown).run(&mut task, &TaskOptions::new());
        assert_eq!(exit, LoopExit::Shutdown);
        // The in-flight call completes; no third call starts.
        assert_eq!(task.calls, 2);
    }

    #[test]
    fn test_panic_is_a_failure() {
        let outcome = invoke(&mut Panicky, &TaskOptions::new());
        assert_eq!(outcome, UnitOutcome::Failed("lost connection".to_string()));

        let timings = fast_timings();
        let shutdown = ShutdownFlag::new();
        let exit = ExecuteLoop::new(&timings, &shutdown).run(&mut Panicky, &TaskOptions::new());
        assert_eq!(exit, LoopExit::Failed);
    }

    #[test]
    fn test_error_message_is_preserved() {
        let mut task = Scripted::new();
        task.fail = true;
        assert_eq!(
            invoke(&mut task, &TaskOptions::new()),
            UnitOutcome::Failed("boom #1".to_string())
        );
    }
}
