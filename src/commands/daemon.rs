//! `nightshift daemon ...`: start, stop, restart and inspect the background
//! daemon. The daemon itself lives in `nightshift::service`; these commands
//! only manage its process and read the files it writes.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::process::{self, Stdio};
use std::time::Duration;

use nightshift::config::Config;
use nightshift::error::DaemonError;
use nightshift::query;
use nightshift::service::health::RestartEvent;
use nightshift::service::pidfile::{
    PidStatus, daemon_log_path, format_duration, is_process_running, kill_process_force,
    kill_process_graceful, pid_file_path, read_pid_file, remove_file_if_exists,
    service_dir, watchdog_log_path, watchdog_pid_path,
};
use nightshift::service::supervisor::DaemonOptions;
use nightshift::service::watchdog::{STOP_GRACE, daemon_run_args, watchdog_args};

pub struct StartOptions {
    pub no_watchdog: bool,
    pub interval: Option<u64>,
    pub max_concurrent: Option<usize>,
}

pub fn run_start(dir: &Path, options: StartOptions, json: bool) -> Result<()> {
    let daemon = DaemonOptions {
        interval: options.interval,
        max_concurrent: options.max_concurrent,
        restart: None,
    };
    start(dir, daemon, options.no_watchdog, json)
}

fn start(dir: &Path, options: DaemonOptions, no_watchdog: bool, json: bool) -> Result<()> {
    super::ensure_initialized(dir)?;
    let config = Config::load(dir)?;
    config.validate().context("Invalid configuration")?;

    let pid_path = pid_file_path(dir);
    match read_pid_file(&pid_path) {
        PidStatus::Running(existing) => {
            return Err(DaemonError::AlreadyRunning { pid: existing.pid }.into());
        }
        PidStatus::Corrupted(detail) => {
            return Err(DaemonError::PidFileCorrupted {
                path: pid_path,
                detail,
            }
            .into());
        }
        PidStatus::Stale(stale) => {
            tracing::info!(pid = stale.pid, "removing stale PID file");
            remove_file_if_exists(&pid_path)?;
        }
        PidStatus::Missing => {}
    }
    let watchdog_path = watchdog_pid_path(dir);
    match read_pid_file(&watchdog_path) {
        // A watchdog between restarts has no live daemon but still owns it
        PidStatus::Running(existing) => {
            return Err(DaemonError::AlreadyRunning { pid: existing.pid }.into());
        }
        PidStatus::Missing => {}
        _ => remove_file_if_exists(&watchdog_path)?,
    }

    let use_watchdog = !no_watchdog && config.watchdog.enabled;
    let (args, log_path) = if use_watchdog {
        (watchdog_args(dir, &options), watchdog_log_path(dir))
    } else {
        (daemon_run_args(dir, &options), daemon_log_path(dir))
    };

    fs::create_dir_all(service_dir(dir)).context("Failed to create service directory")?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open {}", log_path.display()))?;

    let current_exe = std::env::current_exe().context("Failed to get current executable path")?;
    let mut child = process::Command::new(&current_exe)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .spawn()
        .map_err(|e| DaemonError::SpawnFailed(e.to_string()))?;
    let pid = child.id();

    // Wait a moment for the process to come up
    std::thread::sleep(Duration::from_millis(200));
    if let Some(status) = child.try_wait()? {
        return Err(DaemonError::SpawnFailed(format!(
            "process exited immediately ({}); see {}",
            status,
            log_path.display()
        ))
        .into());
    }

    let poll_interval = options.interval.unwrap_or(config.daemon.poll_interval);
    let max_concurrent = options
        .max_concurrent
        .unwrap_or(config.daemon.max_concurrent_tasks);

    if json {
        super::print_json(&serde_json::json!({
            "status": "started",
            "pid": pid,
            "watchdog": use_watchdog,
            "log": log_path,
            "daemon": {
                "poll_interval": poll_interval,
                "max_concurrent_tasks": max_concurrent,
            }
        }))?;
    } else {
        if use_watchdog {
            println!("Daemon started under watchdog (watchdog PID {})", pid);
        } else {
            println!("Daemon started (PID {})", pid);
        }
        println!("Log: {}", log_path.display());
        println!(
            "Daemon: max_concurrent_tasks={}, poll_interval={}s",
            max_concurrent, poll_interval
        );
    }
    Ok(())
}

struct Stopped {
    daemon: Option<u32>,
    watchdog: Option<u32>,
}

fn stop(dir: &Path, force: bool) -> Result<Stopped> {
    let pid_path = pid_file_path(dir);
    let watchdog_path = watchdog_pid_path(dir);

    let daemon = match read_pid_file(&pid_path) {
        PidStatus::Running(file) => Some(file.pid),
        PidStatus::Corrupted(detail) if !force => {
            return Err(DaemonError::PidFileCorrupted {
                path: pid_path,
                detail,
            }
            .into());
        }
        _ => None,
    };
    let watchdog = match read_pid_file(&watchdog_path) {
        PidStatus::Running(file) => Some(file.pid),
        _ => None,
    };

    if daemon.is_none() && watchdog.is_none() {
        remove_file_if_exists(&pid_path)?;
        remove_file_if_exists(&watchdog_path)?;
        if force {
            return Ok(Stopped {
                daemon: None,
                watchdog: None,
            });
        }
        return Err(DaemonError::NotRunning.into());
    }

    // The watchdog goes first so it does not restart the daemon we stop
    if let Some(pid) = watchdog {
        if force {
            kill_process_force(pid)?;
        } else {
            kill_process_graceful(pid, STOP_GRACE * 2)?;
        }
    }
    if let Some(pid) = daemon
        && is_process_running(pid)
    {
        if force {
            kill_process_force(pid)?;
        } else {
            kill_process_graceful(pid, STOP_GRACE)?;
        }
    }

    // A clean shutdown removes these itself; a killed process leaves them
    remove_file_if_exists(&pid_path)?;
    remove_file_if_exists(&watchdog_path)?;

    Ok(Stopped { daemon, watchdog })
}

pub fn run_stop(dir: &Path, force: bool, json: bool) -> Result<()> {
    let stopped = stop(dir, force)?;

    if json {
        super::print_json(&serde_json::json!({
            "status": "stopped",
            "pid": stopped.daemon,
            "watchdog_pid": stopped.watchdog,
            "force": force,
        }))?;
    } else if stopped.daemon.is_none() && stopped.watchdog.is_none() {
        println!("Daemon not running (cleaned up PID files)");
    } else {
        if let Some(pid) = stopped.watchdog {
            println!("Watchdog stopped (PID {})", pid);
        }
        if let Some(pid) = stopped.daemon {
            println!("Daemon stopped (PID {})", pid);
        }
    }
    Ok(())
}

/// Stop whatever is running and start again, recording an operator restart
pub fn run_restart(dir: &Path, json: bool) -> Result<()> {
    match stop(dir, false) {
        Ok(_) => {}
        Err(e) if matches!(e.downcast_ref::<DaemonError>(), Some(DaemonError::NotRunning)) => {}
        Err(e) => return Err(e),
    }
    let options = DaemonOptions {
        restart: Some(RestartEvent {
            timestamp: Utc::now(),
            reason: "operator restart".to_string(),
            exit_code: None,
            triggered_by_watchdog: false,
        }),
        ..DaemonOptions::default()
    };
    start(dir, options, false, json)
}

pub fn run_status(dir: &Path, json: bool) -> Result<()> {
    let config = Config::load(dir)?;
    let capacity = super::open_capacity(dir, &config)?;
    let report = query::daemon_status(dir, &capacity, super::local_now())?;

    if json {
        return super::print_json(&report);
    }

    match report.pid {
        Some(pid) if report.running => {
            println!("Daemon: running (PID {})", pid);
            if let Some(ref uptime) = report.uptime {
                println!("Uptime: {}", uptime);
            }
            match report.last_heartbeat {
                Some(at) => {
                    let age = (Utc::now() - at).num_seconds().max(0);
                    println!("Last heartbeat: {} ago", format_duration(age));
                }
                None => println!("Last heartbeat: none yet"),
            }
        }
        _ if report.stale_pid_file => println!("Daemon: not running (stale PID file)"),
        _ => println!("Daemon: not running"),
    }
    if let Some(pid) = report.watchdog_pid {
        println!("Watchdog: running (PID {})", pid);
    }
    println!(
        "Capacity: {} mode, ${:.2} of ${:.2} spent, new work {}",
        report.capacity.mode,
        report.capacity.spent,
        report.capacity.daily_budget,
        if report.capacity.auto_paused { "held back" } else { "admitted" }
    );
    Ok(())
}

pub fn run_health(dir: &Path, json: bool) -> Result<()> {
    let config = Config::load(dir)?;
    let capacity = super::open_capacity(dir, &config)?;
    let report = query::daemon_health(dir, &capacity, super::local_now());

    if json {
        return super::print_json(&report);
    }

    println!(
        "Daemon: {}",
        if report.running { "running" } else { "not running" }
    );
    let Some(ref health) = report.health else {
        println!("No health record yet");
        return Ok(());
    };

    println!("PID: {} (started {})", health.pid, health.started_at.to_rfc3339());
    println!(
        "Health checks: {} passed, {} failed",
        health.health_checks.passed, health.health_checks.failed
    );
    if let Some(ref error) = health.health_checks.last_error {
        println!("  last error: {}", error);
    }
    println!(
        "Tasks: {} active; {} started, {} completed, {} failed, {} paused, {} cancelled",
        health.active_tasks,
        health.tasks.started,
        health.tasks.completed,
        health.tasks.failed,
        health.tasks.paused,
        health.tasks.cancelled
    );
    if let Some(ref memory) = health.memory {
        println!(
            "Memory: {:.1} MiB resident, {:.1} MiB virtual",
            memory.rss_bytes as f64 / 1_048_576.0,
            memory.virtual_bytes as f64 / 1_048_576.0
        );
    }
    if health.restart_history.is_empty() {
        println!("Restarts: none");
    } else {
        println!("Restarts ({}):", health.restart_history.len());
        for event in &health.restart_history {
            let code = event
                .exit_code
                .map(|c| format!(", exit code {}", c))
                .unwrap_or_default();
            let by = if event.triggered_by_watchdog { "watchdog" } else { "operator" };
            println!(
                "  {} [{}] {}{}",
                event.timestamp.to_rfc3339(),
                by,
                event.reason,
                code
            );
        }
    }
    Ok(())
}
