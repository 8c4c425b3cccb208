//! End-to-end lifecycle tests driving the `warden` binary.
//!
//! Every test gets its own temp directory for the registry and log files,
//! and a config with short intervals so start/stop cycles finish quickly.
//! A guard runs `stop` on drop so a failing assertion never leaks a daemon.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tempfile::TempDir;

const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// Must match `restart_grace` in the sandbox config.
const RESTART_GRACE: Duration = Duration::from_millis(200);

fn warden_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_warden"))
}

struct Sandbox {
    dir: TempDir,
    config: PathBuf,
}

impl Sandbox {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let config = dir.path().join("warden.toml");
        let toml = format!(
            r#"
[paths]
tmp_dir = "{tmp}"
logs_dir = "{logs}"

[pool]
workers = 2

[timing]
poll_interval = "50ms"
failure_backoff = "50ms"
restart_grace = "200ms"
stop_timeout = "2s"
"#,
            tmp = dir.path().display(),
            logs = dir.path().join("logs").display(),
        );
        std::fs::write(&config, toml).expect("write config");
        Self { dir, config }
    }

    fn warden(&self, args: &[&str]) -> Output {
        Command::new(warden_bin())
            .arg("--config")
            .arg(&self.config)
            .args(args)
            .env_remove("WARDEN_TMP_DIR")
            .env_remove("WARDEN_LOGS_DIR")
            .output()
            .expect("run warden")
    }

    fn registry(&self, stem: &str) -> PathBuf {
        self.dir.path().join(format!(".{stem}.pid"))
    }

    fn log(&self, stem: &str) -> PathBuf {
        self.dir.path().join("logs").join(format!("{stem}.log"))
    }

    fn recorded_pids(&self, stem: &str) -> Vec<Pid> {
        std::fs::read_to_string(self.registry(stem))
            .unwrap_or_default()
            .split(',')
            .filter_map(|p| p.trim().parse().ok())
            .map(Pid::from_raw)
            .collect()
    }
}

/// Stops a task's daemon when a test ends, pass or fail.
struct StopOnDrop<'a>(&'a Sandbox, &'static str);

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        let _ = self.0.warden(&[self.1, "stop"]);
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < WAIT_LIMIT {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

fn log_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_owned)
        .collect()
}

/// Time of day of a log line, from its leading `YYYY-MM-DDTHH:MM:SS.ffffffZ`
/// timestamp.
fn line_time(line: &str) -> Option<Duration> {
    let stamp = line.split_whitespace().next()?;
    let (_, time) = stamp.split_once('T')?;
    let mut parts = time.trim_end_matches('Z').split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(Duration::from_secs_f64(hours * 3600.0 + minutes * 60.0 + seconds))
}

/// Pids from the supervisor's `worker forked pid=N` lines.
fn forked_workers(lines: &[String]) -> Vec<Pid> {
    lines
        .iter()
        .filter_map(|line| line.split_once("worker forked"))
        .filter_map(|(_, fields)| {
            let (_, rest) = fields.split_once("pid=")?;
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .map(Pid::from_raw)
        .collect()
}

fn log_count(path: &Path, needle: &str) -> usize {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .matches(needle)
        .count()
}

#[test]
fn test_start_status_stop() {
    let sandbox = Sandbox::new();
    let _guard = StopOnDrop(&sandbox, "heartbeat");

    let started = sandbox.warden(&["heartbeat", "start", "-o", "interval_ms=20"]);
    assert!(started.status.success(), "start failed: {started:?}");

    let pids = sandbox.recorded_pids("warden-heartbeat");
    assert_eq!(pids.len(), 1);
    let supervisor = pids[0];
    assert!(kill(supervisor, None).is_ok());

    let log = sandbox.log("warden.heartbeat");
    assert!(
        wait_until(|| log_count(&log, "worker started") >= 2),
        "workers never started"
    );
    assert!(wait_until(|| log_count(&log, "heartbeat tick=") > 2));

    let status = sandbox.warden(&["heartbeat", "status"]);
    assert!(status.status.success());
    assert_eq!(
        stdout(&status),
        format!("warden:heartbeat process:\n  |-- {supervisor} is Running\n")
    );

    let stopped = sandbox.warden(&["heartbeat", "stop"]);
    assert!(stopped.status.success());
    assert!(!sandbox.registry("warden-heartbeat").exists());
    assert!(
        wait_until(|| log_count(&log, "supervisor stopped") == 1),
        "supervisor did not drain"
    );
}

#[test]
fn test_second_start_reports_status() {
    let sandbox = Sandbox::new();
    let _guard = StopOnDrop(&sandbox, "heartbeat");

    assert!(sandbox.warden(&["heartbeat", "start"]).status.success());
    let first = sandbox.recorded_pids("warden-heartbeat");
    assert_eq!(first.len(), 1);

    let again = sandbox.warden(&["heartbeat", "start"]);
    assert!(again.status.success());
    assert!(stdout(&again).starts_with("warden:heartbeat process:\n"));
    assert_eq!(sandbox.recorded_pids("warden-heartbeat"), first);

    // Operation words are case-sensitive: `STOP` is a status request.
    let shouted = sandbox.warden(&["heartbeat", "STOP"]);
    assert!(shouted.status.success());
    assert!(stdout(&shouted).starts_with("warden:heartbeat process:\n"));
    assert_eq!(sandbox.recorded_pids("warden-heartbeat"), first);
}

#[test]
fn test_restart_replaces_supervisor() {
    let sandbox = Sandbox::new();
    let _guard = StopOnDrop(&sandbox, "heartbeat");

    assert!(sandbox.warden(&["heartbeat", "start"]).status.success());
    let before = sandbox.recorded_pids("warden-heartbeat");

    let log = sandbox.log("warden.heartbeat");
    assert!(wait_until(|| log_count(&log, "worker started") >= 2));

    let begun = Instant::now();
    let restarted = sandbox.warden(&["heartbeat", "restart"]);
    assert!(restarted.status.success(), "restart failed: {restarted:?}");
    assert!(begun.elapsed() >= RESTART_GRACE, "restart took {:?}", begun.elapsed());

    let after = sandbox.recorded_pids("warden-heartbeat");
    assert_eq!(after.len(), 1);
    assert_ne!(after, before);

    // The old supervisor drained before the grace period started; the new
    // daemon only comes up after it.
    assert!(wait_until(|| log_count(&log, "daemon started") == 2));
    let lines = log_lines(&log);
    let stopped = lines
        .iter()
        .position(|l| l.contains("supervisor stopped"))
        .expect("old supervisor never logged its exit");
    let restarted_at = lines[stopped..]
        .iter()
        .find(|l| l.contains("daemon started"))
        .expect("no daemon started after the old supervisor stopped");
    let gap = line_time(restarted_at)
        .unwrap()
        .checked_sub(line_time(&lines[stopped]).unwrap())
        .expect("new daemon logged before the old supervisor stopped");
    assert!(gap >= RESTART_GRACE, "only {gap:?} between stop and new daemon");
}

#[test]
fn test_not_running() {
    let sandbox = Sandbox::new();

    let stopped = sandbox.warden(&["heartbeat", "stop"]);
    assert!(stopped.status.success());
    assert_eq!(stdout(&stopped), "warden:heartbeat is not running\n");

    // No operation and an unknown operation both mean status.
    for args in [&["heartbeat"][..], &["heartbeat", "bogus"][..]] {
        let status = sandbox.warden(args);
        assert!(status.status.success());
        assert_eq!(stdout(&status), "warden:heartbeat is not running\n");
    }
}

#[test]
fn test_invalid_options_print_usage() {
    let sandbox = Sandbox::new();

    for operation in ["start", "restart"] {
        let output = sandbox.warden(&["exec", operation]);
        assert_eq!(output.status.code(), Some(1), "{operation}: {output:?}");
        assert!(stdout(&output).starts_with("usage: warden exec"));
    }
    assert!(!sandbox.registry("warden-exec").exists());
}

#[test]
fn test_failing_workers_are_replaced() {
    let sandbox = Sandbox::new();
    let _guard = StopOnDrop(&sandbox, "exec");
    let output = sandbox.warden(&["exec", "start", "-o", "command=exit 1", "-o", "workers=1"]);
    assert!(output.status.success(), "start failed: {output:?}");

    let log = sandbox.log("warden.exec");
    assert!(
        wait_until(|| log_count(&log, "worker forked") >= 3),
        "failed workers were not replaced"
    );
    assert!(log_count(&log, "work unit failed") >= 2);

    let stopped = sandbox.warden(&["exec", "stop"]);
    assert!(stopped.status.success());
    assert!(!sandbox.registry("warden-exec").exists());
}

#[test]
fn test_stop_terminates_supervisor() {
    let sandbox = Sandbox::new();
    let _guard = StopOnDrop(&sandbox, "heartbeat");

    let started = sandbox.warden(&[
        "heartbeat", "start", "-o", "workers=3", "-o", "interval_ms=20",
    ]);
    assert!(started.status.success(), "start failed: {started:?}");
    let supervisor = sandbox.recorded_pids("warden-heartbeat")[0];

    let log = sandbox.log("warden.heartbeat");
    assert!(
        wait_until(|| log_count(&log, "worker started") >= 3),
        "workers never started"
    );
    let workers = forked_workers(&log_lines(&log));
    assert_eq!(workers.len(), 3, "{workers:?}");

    assert!(sandbox.warden(&["heartbeat", "stop"]).status.success());

    // A zombie still answers kill(pid, 0) until init reaps it, so accept
    // either a vanished pid or the drained log line.
    assert!(wait_until(|| {
        kill(supervisor, None) == Err(Errno::ESRCH) || log_count(&log, "supervisor stopped") == 1
    }));
    // Workers are children of the supervisor, which reaps them all before
    // it exits.
    assert!(
        wait_until(|| workers.iter().all(|&pid| kill(pid, None) == Err(Errno::ESRCH))),
        "workers outlived the supervisor"
    );

    let lines = log_lines(&log);
    let draining = lines
        .iter()
        .position(|l| l.contains("draining workers"))
        .expect("supervisor never drained");
    assert!(forked_workers(&lines[draining..]).is_empty(), "forked after shutdown");
    assert_eq!(forked_workers(&lines).len(), 3);
}
