//! Error taxonomy
//!
//! Each concern has its own error enum next to the code that raises it.
//! This module re-exports them and defines [`DaemonError`], the operator
//! facing errors of the daemon lifecycle. Those carry a stable
//! machine-readable code and a remediation hint.

use std::path::PathBuf;
use thiserror::Error;

pub use crate::capacity::CapacityError;
pub use crate::service::executor::AgentError;
pub use crate::state::TransitionError;
pub use crate::store::StoreError;
pub use crate::workflow::WorkflowError;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("daemon already running (PID {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("daemon is not running")]
    NotRunning,

    #[error("PID file {} is corrupted: {detail}", path.display())]
    PidFileCorrupted { path: PathBuf, detail: String },

    #[error("could not lock {}: {detail}", path.display())]
    LockFailed { path: PathBuf, detail: String },

    #[error("failed to start daemon: {0}")]
    SpawnFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaemonError {
    pub fn code(&self) -> &'static str {
        match self {
            DaemonError::AlreadyRunning { .. } => "ALREADY_RUNNING",
            DaemonError::NotRunning => "NOT_RUNNING",
            DaemonError::PidFileCorrupted { .. } => "PID_FILE_CORRUPTED",
            DaemonError::LockFailed { .. } => "LOCK_FAILED",
            DaemonError::SpawnFailed(_) => "SPAWN_FAILED",
            DaemonError::Io(_) => "IO_ERROR",
        }
    }

    pub fn hint(&self) -> &'static str {
        match self {
            DaemonError::AlreadyRunning { .. } => {
                "stop it first with `nightshift daemon stop`, or use `daemon restart`"
            }
            DaemonError::NotRunning => "start it with `nightshift daemon start`",
            DaemonError::PidFileCorrupted { .. } => {
                "inspect the process by hand, then clear the file with `nightshift daemon stop --force`"
            }
            DaemonError::LockFailed { .. } => {
                "another daemon holds the lock; check `nightshift daemon status`"
            }
            DaemonError::SpawnFailed(_) => "check service/daemon.log for details",
            DaemonError::Io(_) => "check permissions on the project directory",
        }
    }
}
