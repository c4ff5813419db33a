//! Task lifecycle state machine
//!
//! The transition table is the single authority on how a task's status may
//! change. Every mutation names the status it expects the task to be in; a
//! request whose `from` does not match the current status is rejected rather
//! than applied, so two writers racing on the same task cannot silently
//! overwrite each other.
//!
//! ```text
//! pending -> queued -> planning -> in-progress -> completed | failed
//!                                      |  ^
//!                  waiting-approval <--+  +-- paused
//! ```
//!
//! `cancelled`, `failed` and `completed` are terminal.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::task::{Approval, FailureInfo, LogEntry, PauseInfo, Status, Task};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransitionError {
    #[error("task '{id}' is {actual}, not {expected}")]
    StateMismatch {
        id: String,
        expected: Status,
        actual: Status,
    },
    #[error("transition {from} -> {to} is not allowed")]
    NotAllowed { from: Status, to: Status },
    #[error("task '{id}' is {status} and can no longer change; retry creates a new attempt")]
    Terminal { id: String, status: Status },
    #[error("pausing requires pause metadata")]
    MissingPauseInfo,
}

/// Whether the table allows `from -> to`
pub fn can_transition(from: Status, to: Status) -> bool {
    use Status::*;
    matches!(
        (from, to),
        (Pending, Queued)
            | (Pending, Cancelled)
            | (Queued, Planning)
            | (Queued, Paused)
            | (Queued, Cancelled)
            | (Planning, InProgress)
            | (Planning, Paused)
            | (Planning, Failed)
            | (Planning, Cancelled)
            | (InProgress, WaitingApproval)
            | (InProgress, Paused)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Cancelled)
            | (WaitingApproval, InProgress)
            | (WaitingApproval, Cancelled)
            | (Paused, InProgress)
            | (Paused, Queued)
            | (Paused, Cancelled)
    )
}

/// Extra data carried by a transition request
#[derive(Debug, Clone, Default)]
pub struct TransitionMeta {
    pub actor: Option<String>,
    pub reason: Option<String>,
    /// Required when moving to `paused`
    pub pause: Option<PauseInfo>,
    /// Recorded when moving to `failed`
    pub failure: Option<FailureInfo>,
    /// Stage awaiting approval (to `waiting-approval`) or being approved
    /// (from `waiting-approval` to `in-progress`)
    pub stage: Option<String>,
}

impl TransitionMeta {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn paused(pause: PauseInfo) -> Self {
        Self {
            pause: Some(pause),
            ..Self::default()
        }
    }

    pub fn failed(failure: FailureInfo) -> Self {
        Self {
            reason: Some(failure.reason.clone()),
            failure: Some(failure),
            ..Self::default()
        }
    }

    pub fn with_actor(mut self, actor: Option<String>) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }
}

/// Apply `from -> to` to a task, checking the expected current status first.
///
/// On success the task's status, pause/approval/failure metadata and
/// `updated_at` are updated and a log entry is appended. On error the task
/// is left untouched.
pub fn apply_transition(
    task: &mut Task,
    from: Status,
    to: Status,
    meta: TransitionMeta,
    now: DateTime<Utc>,
) -> Result<(), TransitionError> {
    if task.status != from {
        if task.status.is_terminal() {
            return Err(TransitionError::Terminal {
                id: task.id.clone(),
                status: task.status,
            });
        }
        return Err(TransitionError::StateMismatch {
            id: task.id.clone(),
            expected: from,
            actual: task.status,
        });
    }
    if from.is_terminal() {
        return Err(TransitionError::Terminal {
            id: task.id.clone(),
            status: from,
        });
    }
    if !can_transition(from, to) {
        return Err(TransitionError::NotAllowed { from, to });
    }
    if to == Status::Paused && meta.pause.is_none() {
        return Err(TransitionError::MissingPauseInfo);
    }

    // Leaving paused or waiting-approval clears their metadata
    if from == Status::Paused {
        task.pause = None;
    }
    if from == Status::WaitingApproval {
        if to == Status::InProgress
            && let Some(stage) = task.awaiting_stage.clone().or_else(|| meta.stage.clone())
        {
            task.approvals.push(Approval {
                stage,
                approver: meta.actor.clone(),
                approved_at: now,
            });
        }
        task.awaiting_stage = None;
    }

    match to {
        Status::Paused => task.pause = meta.pause.clone(),
        Status::WaitingApproval => task.awaiting_stage = meta.stage.clone(),
        Status::Failed => task.failure = meta.failure.clone(),
        _ => {}
    }
    if to.is_terminal() {
        task.current_stage = None;
    }

    task.status = to;
    task.updated_at = now;
    task.log.push(LogEntry {
        timestamp: now,
        actor: meta.actor.clone(),
        message: describe(from, to, &meta),
    });

    Ok(())
}

fn describe(from: Status, to: Status, meta: &TransitionMeta) -> String {
    let mut message = format!("{} -> {}", from, to);
    if let Some(ref pause) = meta.pause {
        message.push_str(&format!(" (reason: {})", pause.reason));
    } else if let Some(ref reason) = meta.reason {
        message.push_str(&format!(" ({})", reason));
    }
    if let Some(ref stage) = meta.stage {
        message.push_str(&format!(" [stage {}]", stage));
    }
    message
}
