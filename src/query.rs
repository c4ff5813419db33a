//! Status query surface
//!
//! Read-only views over the store, the capacity ledger and the daemon's
//! files, shaped for the CLI and any API layer in front of it. Each report
//! serializes to the JSON the `--json` flag prints.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::capacity::{CapacityModel, CapacitySnapshot};
use crate::error::DaemonError;
use crate::service::health::DaemonHealthRecord;
use crate::service::pidfile::{
    Heartbeat, PidStatus, format_duration, pid_file_path, read_pid_file, watchdog_pid_path,
};
use crate::store::{StoreError, TaskStore};
use crate::task::{PauseReason, Priority, Status, Task};

/// `GET /tasks/:id`
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusReport {
    pub task: Task,
    pub capacity: CapacitySnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub description: String,
    pub workflow: String,
    pub status: Status,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<PauseReason>,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            description: task.description.clone(),
            workflow: task.workflow.clone(),
            status: task.status,
            priority: task.priority,
            current_stage: task
                .current_stage
                .clone()
                .or_else(|| task.awaiting_stage.clone()),
            pause_reason: task.pause.as_ref().map(|p| p.reason),
            cost: task.usage.cost,
            created_at: task.created_at,
        }
    }
}

/// `GET /tasks`
#[derive(Debug, Clone, Serialize)]
pub struct TaskListReport {
    pub tasks: Vec<TaskSummary>,
    /// Task count per status, over every task in the store
    pub counts: BTreeMap<Status, usize>,
    pub capacity: CapacitySnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatusReport {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watchdog_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// The PID file named a process that is gone
    #[serde(default)]
    pub stale_pid_file: bool,
    pub capacity: CapacitySnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct DaemonHealthReport {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<DaemonHealthRecord>,
    pub capacity: CapacitySnapshot,
}

pub fn task_status(
    store: &dyn TaskStore,
    capacity: &CapacityModel,
    id: &str,
    now: NaiveDateTime,
) -> Result<TaskStatusReport, StoreError> {
    Ok(TaskStatusReport {
        task: store.get_or_err(id)?,
        capacity: capacity.snapshot(now),
    })
}

/// Tasks oldest first, optionally only those in `status`
pub fn task_list(
    store: &dyn TaskStore,
    capacity: &CapacityModel,
    status: Option<Status>,
    now: NaiveDateTime,
) -> Result<TaskListReport, StoreError> {
    let mut all = store.list()?;
    all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let mut counts = BTreeMap::new();
    for task in &all {
        *counts.entry(task.status).or_insert(0) += 1;
    }
    let tasks = all
        .iter()
        .filter(|t| status.map(|s| t.status == s).unwrap_or(true))
        .map(TaskSummary::from)
        .collect();

    Ok(TaskListReport {
        tasks,
        counts,
        capacity: capacity.snapshot(now),
    })
}

/// Read the daemon's PID file and heartbeat.
///
/// A corrupted PID file is an error rather than "not running": nothing
/// repairs it except an explicit force-stop.
pub fn daemon_status(
    dir: &Path,
    capacity: &CapacityModel,
    now: NaiveDateTime,
) -> Result<DaemonStatusReport, DaemonError> {
    let path = pid_file_path(dir);
    let mut report = DaemonStatusReport {
        running: false,
        pid: None,
        started_at: None,
        uptime: None,
        watchdog_pid: None,
        last_heartbeat: None,
        stale_pid_file: false,
        capacity: capacity.snapshot(now),
    };

    match read_pid_file(&path) {
        PidStatus::Missing => {}
        PidStatus::Stale(_) => report.stale_pid_file = true,
        PidStatus::Corrupted(detail) => {
            return Err(DaemonError::PidFileCorrupted { path, detail });
        }
        PidStatus::Running(file) => {
            report.running = true;
            report.pid = Some(file.pid);
            report.started_at = Some(file.started_at);
            report.uptime = Some(format_duration(file.uptime_secs(Utc::now())));
            report.last_heartbeat = Heartbeat::read(dir)
                .filter(|beat| beat.pid == file.pid)
                .map(|beat| beat.at);
        }
    }
    if let PidStatus::Running(watchdog) = read_pid_file(&watchdog_pid_path(dir)) {
        report.watchdog_pid = Some(watchdog.pid);
    }
    Ok(report)
}

pub fn daemon_health(dir: &Path, capacity: &CapacityModel, now: NaiveDateTime) -> DaemonHealthReport {
    let running = matches!(read_pid_file(&pid_file_path(dir)), PidStatus::Running(_));
    DaemonHealthReport {
        running,
        health: DaemonHealthRecord::load(dir),
        capacity: capacity.snapshot(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapacityConfig;
    use crate::service::pidfile::{PidFile, write_pid_file};
    use crate::store::MemoryTaskStore;
    use crate::test_helpers::{local_at, paused_task, queued_task, running_task};
    use tempfile::TempDir;

    #[test]
    fn test_task_list_filters_and_counts() {
        let store = MemoryTaskStore::with_tasks(vec![
            queued_task("a"),
            running_task("b"),
            paused_task("c", PauseReason::Capacity, Status::Queued),
        ]);
        let capacity = CapacityModel::new(&CapacityConfig::default());

        let report = task_list(&store, &capacity, None, local_at(10, 0)).unwrap();
        assert_eq!(report.tasks.len(), 3);
        assert_eq!(report.counts[&Status::Queued], 1);
        assert_eq!(report.counts[&Status::Paused], 1);

        let paused = task_list(&store, &capacity, Some(Status::Paused), local_at(10, 0)).unwrap();
        assert_eq!(paused.tasks.len(), 1);
        assert_eq!(paused.tasks[0].pause_reason, Some(PauseReason::Capacity));
        assert_eq!(paused.counts.len(), 3);
    }

    #[test]
    fn test_task_status_unknown_id() {
        let store = MemoryTaskStore::new();
        let capacity = CapacityModel::new(&CapacityConfig::default());
        assert!(matches!(
            task_status(&store, &capacity, "nope", local_at(10, 0)),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_daemon_status_states() {
        let temp_dir = TempDir::new().unwrap();
        let capacity = CapacityModel::new(&CapacityConfig::default());

        let report = daemon_status(temp_dir.path(), &capacity, local_at(10, 0)).unwrap();
        assert!(!report.running);

        write_pid_file(&pid_file_path(temp_dir.path()), &PidFile::current()).unwrap();
        let report = daemon_status(temp_dir.path(), &capacity, local_at(10, 0)).unwrap();
        assert!(report.running);
        assert_eq!(report.pid, Some(std::process::id()));

        std::fs::write(pid_file_path(temp_dir.path()), "{").unwrap();
        let err = daemon_status(temp_dir.path(), &capacity, local_at(10, 0)).unwrap_err();
        assert_eq!(err.code(), "PID_FILE_CORRUPTED");
    }
}
