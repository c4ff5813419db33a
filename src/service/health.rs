//! Daemon health record
//!
//! Owned by the running daemon and persisted to `service/health.json`. It
//! survives restarts: a new daemon keeps the restart history and counters of
//! the previous one and only resets the per-lifetime fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::pidfile::{service_dir, write_atomic};

/// Restart events kept in the record, most recent first
pub const MAX_RESTART_HISTORY: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartEvent {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub triggered_by_watchdog: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCounters {
    #[serde(default)]
    pub started: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub paused: u64,
    #[serde(default)]
    pub cancelled: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckCounters {
    #[serde(default)]
    pub passed: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonHealthRecord {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restart_history: Vec<RestartEvent>,
    #[serde(default)]
    pub health_checks: HealthCheckCounters,
    #[serde(default)]
    pub tasks: TaskCounters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemorySnapshot>,
    #[serde(default)]
    pub active_tasks: usize,
}

impl DaemonHealthRecord {
    pub fn new(pid: u32, now: DateTime<Utc>) -> Self {
        Self {
            pid,
            started_at: now,
            last_heartbeat: None,
            restart_history: Vec::new(),
            health_checks: HealthCheckCounters::default(),
            tasks: TaskCounters::default(),
            memory: None,
            active_tasks: 0,
        }
    }

    /// Start a new daemon lifetime on top of whatever the last daemon left
    /// behind
    pub fn begin_lifetime(previous: Option<Self>, pid: u32, now: DateTime<Utc>) -> Self {
        let mut record = Self::new(pid, now);
        if let Some(previous) = previous {
            record.restart_history = previous.restart_history;
            record.health_checks = previous.health_checks;
            record.tasks = previous.tasks;
        }
        record
    }

    pub fn record_restart(&mut self, event: RestartEvent) {
        self.restart_history.insert(0, event);
        self.restart_history.truncate(MAX_RESTART_HISTORY);
    }

    pub fn record_check(&mut self, result: Result<(), String>, now: DateTime<Utc>) {
        self.health_checks.last_check_at = Some(now);
        match result {
            Ok(()) => {
                self.health_checks.passed += 1;
                self.health_checks.last_error = None;
            }
            Err(e) => {
                self.health_checks.failed += 1;
                self.health_checks.last_error = Some(e);
            }
        }
    }

    pub fn uptime_secs(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.started_at).num_seconds().max(0)
    }

    pub fn load(dir: &Path) -> Option<Self> {
        let content = fs::read_to_string(health_path(dir)).ok()?;
        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unreadable health record");
                None
            }
        }
    }

    pub fn save(&self, dir: &Path) -> std::io::Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        write_atomic(&health_path(dir), content.as_bytes())
    }
}

pub fn health_path(dir: &Path) -> PathBuf {
    service_dir(dir).join("health.json")
}

/// Resident and virtual size of this process, where the platform exposes it
pub fn sample_memory() -> Option<MemorySnapshot> {
    let content = fs::read_to_string("/proc/self/status").ok()?;
    let (rss_bytes, virtual_bytes) = parse_proc_status(&content)?;
    Some(MemorySnapshot {
        rss_bytes,
        virtual_bytes,
        sampled_at: Utc::now(),
    })
}

/// Pull `VmRSS` and `VmSize` (reported in kB) out of `/proc/<pid>/status`
pub fn parse_proc_status(content: &str) -> Option<(u64, u64)> {
    let field = |name: &str| -> Option<u64> {
        content
            .lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l[name.len()..].split_whitespace().next())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|kb| kb * 1024)
    };
    Some((field("VmRSS:")?, field("VmSize:")?))
}
