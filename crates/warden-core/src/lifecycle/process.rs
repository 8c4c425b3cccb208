//! Signalling and waiting on recorded supervisor processes.

use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use tracing::{debug, warn};

/// How a wait on a supervisor ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The process is gone.
    Exited,
    /// The process was still present when the timeout elapsed.
    TimedOut,
}

/// Process operations used by `stop`.
pub trait ProcessControl {
    /// Send the termination signal to `pid`.
    ///
    /// # Errors
    ///
    /// Returns the `errno` of a failed send.
    fn terminate(&self, pid: Pid) -> Result<(), Errno>;

    /// Block until `pid` has exited.
    ///
    /// A child of the calling process is reaped with a blocking `waitpid`.
    /// Any other process is probed every `poll` until it disappears or
    /// `timeout` elapses.
    fn wait_for_exit(&self, pid: Pid, poll: Duration, timeout: Duration) -> WaitOutcome;
}

/// [`ProcessControl`] backed by `kill(2)` and `waitpid(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessControl;

impl ProcessControl for OsProcessControl {
    fn terminate(&self, pid: Pid) -> Result<(), Errno> {
        kill(pid, Signal::SIGTERM)
    }

    fn wait_for_exit(&self, pid: Pid, poll: Duration, timeout: Duration) -> WaitOutcome {
        loop {
            match waitpid(pid, None) {
                Ok(status) => {
                    debug!(%pid, ?status, "reaped supervisor");
                    return WaitOutcome::Exited;
                },
                Err(Errno::EINTR) => continue,
                // Not our child: started by an earlier invocation.
                Err(Errno::ECHILD) => break,
                Err(errno) => {
                    warn!(%pid, %errno, "waitpid failed; probing instead");
                    break;
                },
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            if kill(pid, None) == Err(Errno::ESRCH) {
                return WaitOutcome::Exited;
            }
            if Instant::now() >= deadline {
                warn!(%pid, ?timeout, "supervisor still present after stop timeout");
                return WaitOutcome::TimedOut;
            }
            thread::sleep(poll);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[test]
    fn test_terminate_and_reap_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid::from_raw(child.id() as i32);

        let control = OsProcessControl;
        control.terminate(pid).unwrap();
        let outcome = control.wait_for_exit(pid, Duration::from_millis(10), Duration::from_secs(5));
        assert_eq!(outcome, WaitOutcome::Exited);
        assert_eq!(kill(pid, None), Err(Errno::ESRCH));
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[test]
    fn test_wait_times_out_for_unrelated_live_process() {
        // Our own pid is alive and is not our child.
        let pid = nix::unistd::getpid();
        let outcome = OsProcessControl.wait_for_exit(
            pid,
            Duration::from_millis(5),
            Duration::from_millis(20),
        );
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }
}
