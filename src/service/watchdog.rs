//! Watchdog
//!
//! A separate process that runs `daemon run` as its child and keeps it
//! alive. The daemon is restarted when it exits with a failure status or
//! stops writing its heartbeat file for longer than
//! `watchdog.heartbeat_timeout`. Restarts back off exponentially, and the
//! backoff resets once a daemon has stayed up for `watchdog.stable_after`.
//!
//! The watchdog never writes the daemon's files. It hands the restart
//! reason to the new daemon on its command line, and the daemon records the
//! restart in its own health record.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::health::RestartEvent;
use super::pidfile::{
    Heartbeat, PidFile, PidStatus, daemon_log_path, kill_process_graceful, pid_file_path,
    read_pid_file, remove_file_if_exists, watchdog_pid_path, write_pid_file,
};
use super::supervisor::{DaemonOptions, wait_for_signal};
use crate::config::{Config, WatchdogConfig};
use crate::error::DaemonError;

/// Grace period between SIGTERM and SIGKILL when stopping the daemon
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Exponential restart delay
#[derive(Debug, Clone, PartialEq)]
pub struct RestartBackoff {
    initial: Duration,
    max: Duration,
    stable_after: Duration,
    current: Duration,
}

impl RestartBackoff {
    pub fn new(initial: Duration, max: Duration, stable_after: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            stable_after,
            current: initial,
        }
    }

    pub fn from_config(config: &WatchdogConfig) -> Self {
        Self::new(
            Duration::from_secs(config.initial_backoff),
            Duration::from_secs(config.max_backoff),
            Duration::from_secs(config.stable_after),
        )
    }

    /// Delay before the next restart of a daemon that ran for `uptime`
    pub fn next_delay(&mut self, uptime: Duration) -> Duration {
        if uptime >= self.stable_after {
            self.current = self.initial;
        }
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// What the heartbeat file says about the child daemon
#[derive(Debug, Clone, PartialEq)]
pub enum Liveness {
    Alive,
    /// No heartbeat from this child yet, still within the timeout
    Starting,
    Hung { silent_for: Duration },
}

pub fn assess(
    heartbeat: Option<&Heartbeat>,
    child_pid: u32,
    child_started: DateTime<Utc>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> Liveness {
    let last_sign = match heartbeat {
        Some(beat) if beat.pid == child_pid && beat.at >= child_started => Some(beat.at),
        _ => None,
    };
    let since = last_sign.unwrap_or(child_started);
    let silent_for = now
        .signed_duration_since(since)
        .to_std()
        .unwrap_or(Duration::ZERO);
    if silent_for > timeout {
        Liveness::Hung { silent_for }
    } else if last_sign.is_some() {
        Liveness::Alive
    } else {
        Liveness::Starting
    }
}

/// Command-line arguments that start `daemon run` with `options`
pub fn daemon_run_args(dir: &Path, options: &DaemonOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--dir".into(),
        dir.as_os_str().to_owned(),
        "daemon".into(),
        "run".into(),
    ];
    push_common_args(&mut args, options);
    args
}

/// Command-line arguments that start the watchdog with `options`
pub fn watchdog_args(dir: &Path, options: &DaemonOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--dir".into(),
        dir.as_os_str().to_owned(),
        "daemon".into(),
        "watchdog".into(),
    ];
    push_common_args(&mut args, options);
    args
}

fn push_common_args(args: &mut Vec<OsString>, options: &DaemonOptions) {
    if let Some(interval) = options.interval {
        args.push("--interval".into());
        args.push(interval.to_string().into());
    }
    if let Some(max) = options.max_concurrent {
        args.push("--max-concurrent".into());
        args.push(max.to_string().into());
    }
    if let Some(ref event) = options.restart {
        args.push("--restart-reason".into());
        args.push(event.reason.clone().into());
        if let Some(code) = event.exit_code {
            args.push("--restart-exit-code".into());
            args.push(code.to_string().into());
        }
        if event.triggered_by_watchdog {
            args.push("--watchdog-restart".into());
        }
    }
}

fn spawn_daemon(exe: &Path, dir: &Path, options: &DaemonOptions) -> Result<tokio::process::Child> {
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(daemon_log_path(dir))
        .context("failed to open daemon log")?;
    let child = tokio::process::Command::new(exe)
        .args(daemon_run_args(dir, options))
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .spawn()
        .map_err(|e| DaemonError::SpawnFailed(e.to_string()))?;
    Ok(child)
}

async fn stop_child(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let result = tokio::task::spawn_blocking(move || kill_process_graceful(pid, STOP_GRACE)).await;
        if let Ok(Err(e)) = result {
            tracing::warn!(pid, error = %e, "failed to stop daemon");
        }
    }
    let _ = child.wait().await;
}

/// Entry point of `daemon watchdog`
pub fn run_watchdog(dir: &Path, options: DaemonOptions) -> Result<()> {
    let config = Config::load(dir)?;
    let pid_path = watchdog_pid_path(dir);
    if let PidStatus::Running(existing) = read_pid_file(&pid_path)
        && existing.pid != std::process::id()
    {
        return Err(DaemonError::AlreadyRunning { pid: existing.pid }.into());
    }
    write_pid_file(&pid_path, &PidFile::current())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let result = runtime.block_on(supervise(dir, &config.watchdog, options));

    remove_file_if_exists(&pid_path)?;
    result
}

async fn supervise(dir: &Path, config: &WatchdogConfig, mut options: DaemonOptions) -> Result<()> {
    let exe = std::env::current_exe().context("failed to locate current executable")?;
    let timeout = Duration::from_secs(config.heartbeat_timeout.max(1));
    let mut backoff = RestartBackoff::from_config(config);

    let (shutdown_tx, mut shutdown) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    loop {
        let mut child = spawn_daemon(&exe, dir, &options)?;
        let pid = child.id().unwrap_or(0);
        let started = Utc::now();
        let started_instant = Instant::now();
        tracing::info!(pid, "daemon started under watchdog");

        let mut check = tokio::time::interval(Duration::from_secs(config.check_interval.max(1)));
        let (reason, exit_code) = loop {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) if status.success() => {
                            tracing::info!(pid, "daemon exited cleanly; watchdog stopping");
                            return Ok(());
                        }
                        Ok(status) => break (format!("daemon exited with {}", status), status.code()),
                        Err(e) => break (format!("lost track of daemon: {}", e), None),
                    }
                }
                _ = check.tick() => {
                    let beat = Heartbeat::read(dir);
                    if let Liveness::Hung { silent_for } =
                        assess(beat.as_ref(), pid, started, Utc::now(), timeout)
                    {
                        tracing::warn!(pid, silent_secs = silent_for.as_secs(), "daemon missed heartbeats; killing it");
                        stop_child(&mut child).await;
                        break (format!("no heartbeat for {}s", silent_for.as_secs()), None);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(pid, "watchdog stopping daemon");
                        stop_child(&mut child).await;
                        return Ok(());
                    }
                }
            }
        };

        // A corrupted PID file needs the operator; restarting would only fail again
        let daemon_pid = pid_file_path(dir);
        if let PidStatus::Corrupted(detail) = read_pid_file(&daemon_pid) {
            tracing::error!(%reason, %detail, "daemon PID file is corrupted; watchdog stopping");
            return Err(DaemonError::PidFileCorrupted {
                path: daemon_pid,
                detail,
            }
            .into());
        }

        let delay = backoff.next_delay(started_instant.elapsed());
        tracing::warn!(%reason, ?exit_code, delay_secs = delay.as_secs(), "restarting daemon");
        options.restart = Some(RestartEvent {
            timestamp: Utc::now(),
            reason,
            exit_code,
            triggered_by_watchdog: true,
        });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return Ok(()),
        }
    }
}
