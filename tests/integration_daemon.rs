//! Integration test for the daemon end-to-end flow: start it without a
//! watchdog, let it pick up a task and drive the default workflow with the
//! starter agents, then stop it.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use chrono::Utc;
use nightshift::service::health::{DaemonHealthRecord, RestartEvent};

fn ns_cmd(dir: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_nightshift"))
        .arg("--dir")
        .arg(dir)
        .args(args)
        .env_remove("RUST_LOG")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .unwrap_or_else(|e| panic!("Failed to run nightshift {:?}: {}", args, e))
}

fn ns_json(dir: &Path, args: &[&str]) -> serde_json::Value {
    let mut full = vec!["--json"];
    full.extend_from_slice(args);
    let output = ns_cmd(dir, &full);
    assert!(
        output.status.success(),
        "nightshift {:?} failed.\nstdout: {}\nstderr: {}",
        args,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

/// Kills the daemon if a test bails out before stopping it
struct DaemonGuard(PathBuf);

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = ns_cmd(&self.0, &["daemon", "stop", "--force"]);
    }
}

fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    false
}

#[test]
fn test_daemon_runs_task_to_completion() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join(".nightshift");
    ns_json(&dir, &["init"]);
    ns_json(
        &dir,
        &["add", "Ship it", "--id", "ship", "--autonomy", "autonomous"],
    );

    let started = ns_json(
        &dir,
        &["daemon", "start", "--no-watchdog", "--interval", "1"],
    );
    assert_eq!(started["status"], "started");
    let _guard = DaemonGuard(dir.clone());

    assert!(
        wait_for(Duration::from_secs(10), || {
            ns_json(&dir, &["daemon", "status"])["running"] == true
        }),
        "daemon never wrote its PID file"
    );

    // A second daemon is refused while the first one runs
    let output = ns_cmd(&dir, &["daemon", "start", "--no-watchdog"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("ALREADY_RUNNING"));

    let completed = wait_for(Duration::from_secs(30), || {
        ns_json(&dir, &["show", "ship"])["task"]["status"] == "completed"
    });
    let task = ns_json(&dir, &["show", "ship"]);
    assert!(completed, "task did not complete: {}", task);

    let runs = task["task"]["stage_runs"].as_array().unwrap();
    let outcome = |stage: &str| {
        runs.iter()
            .rev()
            .find(|r| r["stage"] == stage)
            .map(|r| r["outcome"].clone())
    };
    assert_eq!(outcome("plan"), Some("succeeded".into()));
    assert_eq!(outcome("review"), Some("succeeded".into()));
    assert_eq!(outcome("fix"), Some("skipped".into()));

    let stopped = ns_json(&dir, &["daemon", "stop"]);
    assert_eq!(stopped["status"], "stopped");
    assert!(!dir.join("service/daemon.pid").exists());

    let health = ns_json(&dir, &["daemon", "health"]);
    assert_eq!(health["running"], false);
    assert!(health["health"]["tasks"]["completed"].as_u64().unwrap() >= 1);
}

fn restart_history(dir: &Path) -> Vec<serde_json::Value> {
    ns_json(dir, &["daemon", "health"])["health"]["restart_history"]
        .as_array()
        .cloned()
        .unwrap_or_default()
}

#[test]
fn test_operator_restart_is_recorded() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join(".nightshift");
    ns_json(&dir, &["init"]);
    ns_json(&dir, &["daemon", "start", "--no-watchdog", "--interval", "1"]);
    let _guard = DaemonGuard(dir.clone());

    assert!(wait_for(Duration::from_secs(10), || {
        ns_json(&dir, &["daemon", "status"])["running"] == true
    }));
    let first = ns_json(&dir, &["daemon", "status"])["pid"].clone();
    assert!(restart_history(&dir).is_empty());

    let restarted = ns_json(&dir, &["daemon", "restart"]);
    assert_eq!(restarted["status"], "started");

    assert!(
        wait_for(Duration::from_secs(15), || {
            let status = ns_json(&dir, &["daemon", "status"]);
            status["running"] == true
                && status["pid"] != first
                && !restart_history(&dir).is_empty()
        }),
        "restarted daemon never came up"
    );
    let history = restart_history(&dir);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["reason"], "operator restart");
    assert_eq!(history[0]["triggered_by_watchdog"], false);

    ns_json(&dir, &["daemon", "stop"]);
}

#[test]
fn test_watchdog_restart_lands_in_health_record() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join(".nightshift");
    ns_json(&dir, &["init"]);

    // A full history from earlier lifetimes
    let mut seeded = DaemonHealthRecord::new(1, Utc::now());
    for n in 0..20 {
        seeded.record_restart(RestartEvent {
            timestamp: Utc::now(),
            reason: format!("crash {}", n),
            exit_code: Some(1),
            triggered_by_watchdog: true,
        });
    }
    seeded.save(&dir).unwrap();

    // What the watchdog runs after the previous daemon died
    let mut child = Command::new(env!("CARGO_BIN_EXE_nightshift"))
        .arg("--dir")
        .arg(&dir)
        .args([
            "daemon",
            "run",
            "--interval",
            "1",
            "--restart-reason",
            "daemon exited with exit status: 3",
            "--restart-exit-code",
            "3",
            "--watchdog-restart",
        ])
        .env_remove("RUST_LOG")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let _guard = DaemonGuard(dir.clone());

    let landed = wait_for(Duration::from_secs(10), || {
        restart_history(&dir)
            .first()
            .is_some_and(|e| e["exit_code"] == 3)
    });
    assert!(landed, "restart event never recorded");

    let history = restart_history(&dir);
    assert_eq!(history.len(), 20);
    assert_eq!(history[0]["reason"], "daemon exited with exit status: 3");
    assert_eq!(history[0]["triggered_by_watchdog"], true);
    assert_eq!(history[1]["reason"], "crash 19");
    assert_eq!(history[19]["reason"], "crash 1");

    // Wait until the loop is beating so its signal handler is in place
    assert!(wait_for(Duration::from_secs(10), || {
        !ns_json(&dir, &["daemon", "status"])["last_heartbeat"].is_null()
    }));
    std::thread::sleep(Duration::from_millis(300));

    // The daemon is our own child here; signal it and reap it directly
    let term = Command::new("kill")
        .arg("-TERM")
        .arg(child.id().to_string())
        .status()
        .unwrap();
    assert!(term.success());
    let status = child.wait().unwrap();
    assert!(status.success());
    assert!(!dir.join("service/daemon.pid").exists());
}
