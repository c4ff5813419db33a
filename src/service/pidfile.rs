//! PID file, daemon lock and process helpers
//!
//! Files under `<dir>/service/`:
//!
//! - `daemon.pid`: `{pid, started_at}` of the running daemon
//! - `watchdog.pid`: same, for the watchdog supervising it
//! - `daemon.lock`: held with an exclusive `flock` for the daemon's lifetime;
//!   the file itself is never removed
//! - `heartbeat`: `{pid, at}`, rewritten by the daemon on every beat
//!
//! Only the owning process writes its files; everyone else reads them and
//! sends signals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::DaemonError;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

pub fn service_dir(dir: &Path) -> PathBuf {
    dir.join("service")
}

pub fn pid_file_path(dir: &Path) -> PathBuf {
    service_dir(dir).join("daemon.pid")
}

pub fn watchdog_pid_path(dir: &Path) -> PathBuf {
    service_dir(dir).join("watchdog.pid")
}

pub fn lock_file_path(dir: &Path) -> PathBuf {
    service_dir(dir).join("daemon.lock")
}

pub fn heartbeat_path(dir: &Path) -> PathBuf {
    service_dir(dir).join("heartbeat")
}

pub fn daemon_log_path(dir: &Path) -> PathBuf {
    service_dir(dir).join("daemon.log")
}

pub fn watchdog_log_path(dir: &Path) -> PathBuf {
    service_dir(dir).join("watchdog.log")
}

/// Contents of a PID file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidFile {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

impl PidFile {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
        }
    }

    pub fn uptime_secs(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.started_at).num_seconds().max(0)
    }
}

/// What a PID file says about its process
#[derive(Debug, Clone, PartialEq)]
pub enum PidStatus {
    Missing,
    Running(PidFile),
    /// The file names a process that no longer exists
    Stale(PidFile),
    Corrupted(String),
}

pub fn read_pid_file(path: &Path) -> PidStatus {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return PidStatus::Missing,
        Err(e) => return PidStatus::Corrupted(e.to_string()),
    };
    match serde_json::from_str::<PidFile>(&content) {
        Ok(file) if file.pid == 0 => PidStatus::Corrupted("pid 0".to_string()),
        Ok(file) if is_process_running(file.pid) => PidStatus::Running(file),
        Ok(file) => PidStatus::Stale(file),
        Err(e) => PidStatus::Corrupted(e.to_string()),
    }
}

/// Write a PID file via temp file + rename
pub fn write_pid_file(path: &Path, file: &PidFile) -> std::io::Result<()> {
    let content = serde_json::to_string_pretty(file).map_err(std::io::Error::other)?;
    write_atomic(path, content.as_bytes())
}

pub fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Write `bytes` to `path` so readers see either the old or the new file
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp.{}", file_name, std::process::id()));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

/// Liveness beacon written by the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub pid: u32,
    pub at: DateTime<Utc>,
}

impl Heartbeat {
    pub fn write(dir: &Path) -> std::io::Result<()> {
        let beat = Heartbeat {
            pid: std::process::id(),
            at: Utc::now(),
        };
        let content = serde_json::to_string(&beat).map_err(std::io::Error::other)?;
        write_atomic(&heartbeat_path(dir), content.as_bytes())
    }

    pub fn read(dir: &Path) -> Option<Heartbeat> {
        let content = fs::read_to_string(heartbeat_path(dir)).ok()?;
        serde_json::from_str(&content).ok()
    }
}

/// Exclusive lock held by the running daemon; released on drop
#[derive(Debug)]
pub struct DaemonLock {
    #[cfg_attr(not(unix), allow(dead_code))]
    file: File,
    path: PathBuf,
}

impl DaemonLock {
    /// Take the lock without waiting; fails with `LOCK_FAILED` if another
    /// process holds it
    pub fn acquire(dir: &Path) -> Result<Self, DaemonError> {
        let path = lock_file_path(dir);
        fs::create_dir_all(service_dir(dir))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| DaemonError::LockFailed {
                path: path.clone(),
                detail: e.to_string(),
            })?;

        #[cfg(unix)]
        {
            let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if ret != 0 {
                return Err(DaemonError::LockFailed {
                    path,
                    detail: std::io::Error::last_os_error().to_string(),
                });
            }
        }

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Check if a process is running
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> std::io::Result<bool> {
    if unsafe { libc::kill(pid as i32, signal) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(true)
}

/// Send SIGTERM, wait up to `grace`, then SIGKILL
#[cfg(unix)]
pub fn kill_process_graceful(pid: u32, grace: Duration) -> std::io::Result<()> {
    if !is_process_running(pid) {
        return Ok(());
    }
    if !send_signal(pid, libc::SIGTERM)? {
        return Ok(());
    }

    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < grace {
        std::thread::sleep(step);
        waited += step;
        if !is_process_running(pid) {
            return Ok(());
        }
    }

    tracing::warn!(pid, "process ignored SIGTERM; sending SIGKILL");
    send_signal(pid, libc::SIGKILL).map(|_| ())
}

#[cfg(not(unix))]
pub fn kill_process_graceful(_pid: u32, _grace: Duration) -> std::io::Result<()> {
    Err(std::io::Error::other(
        "process signals are only supported on Unix systems",
    ))
}

/// Send SIGKILL immediately
#[cfg(unix)]
pub fn kill_process_force(pid: u32) -> std::io::Result<()> {
    if !is_process_running(pid) {
        return Ok(());
    }
    send_signal(pid, libc::SIGKILL).map(|_| ())
}

#[cfg(not(unix))]
pub fn kill_process_force(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::other(
        "process signals are only supported on Unix systems",
    ))
}

/// Format a duration in seconds to human-readable string
pub fn format_duration(secs: i64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        format!("{}h {}m", hours, mins)
    } else {
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        format!("{}d {}h", days, hours)
    }
}
