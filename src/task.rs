use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// A log entry for tracking lifecycle changes on a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub message: String,
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    #[default]
    Pending,
    Queued,
    Planning,
    InProgress,
    WaitingApproval,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl Status {
    /// Completed, failed and cancelled tasks never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Queued => "queued",
            Status::Planning => "planning",
            Status::InProgress => "in-progress",
            Status::WaitingApproval => "waiting-approval",
            Status::Paused => "paused",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "queued" => Ok(Status::Queued),
            "planning" => Ok(Status::Planning),
            "in-progress" => Ok(Status::InProgress),
            "waiting-approval" => Ok(Status::WaitingApproval),
            "paused" => Ok(Status::Paused),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            "cancelled" => Ok(Status::Cancelled),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// Task priority. Ordering is significant: `Urgent` sorts highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("unknown priority '{}' (low|normal|high|urgent)", other)),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        };
        f.write_str(s)
    }
}

/// How much human gating a task gets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AutonomyLevel {
    /// Every stage waits for approval
    Manual,
    /// Only stages marked `approval: true` wait
    #[default]
    Supervised,
    /// Approval gates are ignored
    Autonomous,
}

impl FromStr for AutonomyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(AutonomyLevel::Manual),
            "supervised" => Ok(AutonomyLevel::Supervised),
            "autonomous" => Ok(AutonomyLevel::Autonomous),
            other => Err(format!(
                "unknown autonomy level '{}' (manual|supervised|autonomous)",
                other
            )),
        }
    }
}

/// Why a task is paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    RateLimit,
    UserRequest,
    Capacity,
}

impl PauseReason {
    /// Only system-initiated pauses are eligible for auto-resume
    pub fn auto_resumable(self) -> bool {
        matches!(self, PauseReason::RateLimit | PauseReason::Capacity)
    }
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PauseReason::RateLimit => "rate_limit",
            PauseReason::UserRequest => "user_request",
            PauseReason::Capacity => "capacity",
        };
        f.write_str(s)
    }
}

/// Pause metadata, present only while a task is paused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseInfo {
    pub reason: PauseReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
    /// Status the task was paused from; decides where resume goes
    pub paused_from: Status,
    pub paused_at: DateTime<Utc>,
}

impl PauseInfo {
    pub fn new(reason: PauseReason, paused_from: Status, now: DateTime<Utc>) -> Self {
        Self {
            reason,
            resume_at: None,
            paused_from,
            paused_at: now,
        }
    }

    pub fn with_resume_at(mut self, at: DateTime<Utc>) -> Self {
        self.resume_at = Some(at);
        self
    }

    /// Where a resume transition lands: back to the queue if the task never
    /// started running, otherwise straight back to work.
    pub fn resume_target(&self) -> Status {
        match self.paused_from {
            Status::Pending | Status::Queued | Status::Planning => Status::Queued,
            _ => Status::InProgress,
        }
    }
}

/// Token and cost usage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost: f64,
}

impl Usage {
    pub fn tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost += other.cost.max(0.0);
    }

    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.cost == 0.0
    }
}

/// Terminal outcome of one stage run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
}

impl StageOutcome {
    /// Failed and timed-out stages poison their dependents
    pub fn is_failure(self) -> bool {
        matches!(self, StageOutcome::Failed | StageOutcome::TimedOut)
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageOutcome::Succeeded => "succeeded",
            StageOutcome::Failed => "failed",
            StageOutcome::TimedOut => "timed-out",
            StageOutcome::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Why a stage was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipCause {
    /// The stage condition evaluated false; dependents still run
    ConditionFalse,
    /// A dependency failed; dependents are skipped too
    UpstreamFailed,
}

/// Per-task, per-stage execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRun {
    pub stage: String,
    pub agent: String,
    /// Attempts made, bounded by the stage's retry budget + 1
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, serde_json::Value>,
    pub outcome: StageOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_cause: Option<SkipCause>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Usage::is_zero")]
    pub usage: Usage,
}

impl StageRun {
    pub fn skipped(stage: &str, agent: &str, cause: SkipCause, now: DateTime<Utc>) -> Self {
        Self {
            stage: stage.to_string(),
            agent: agent.to_string(),
            attempts: 0,
            started_at: None,
            ended_at: Some(now),
            outputs: BTreeMap::new(),
            outcome: StageOutcome::Skipped,
            skip_cause: Some(cause),
            error: None,
            usage: Usage::default(),
        }
    }
}

/// Summary of why a task failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub reason: String,
    #[serde(default)]
    pub attempts: u32,
}

/// Record of a human approval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    pub approved_at: DateTime<Utc>,
}

/// One unit of work driven through a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    /// Name of the workflow graph this task runs
    pub workflow: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub autonomy: AutonomyLevel,
    #[serde(default)]
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Usage::is_zero")]
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause: Option<PauseInfo>,
    /// Stage waiting on a human gate while status is waiting-approval
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awaiting_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approvals: Vec<Approval>,
    /// Every stage run, historical ones included, in recording order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stage_runs: Vec<StageRun>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    /// Task this one retries, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<LogEntry>,
}

fn default_attempt() -> u32 {
    1
}

impl Task {
    pub fn new(id: &str, description: &str, workflow: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            description: description.to_string(),
            workflow: workflow.to_string(),
            priority: Priority::default(),
            autonomy: AutonomyLevel::default(),
            status: Status::Pending,
            current_stage: None,
            usage: Usage::default(),
            created_at: now,
            updated_at: now,
            pause: None,
            awaiting_stage: None,
            approvals: Vec::new(),
            stage_runs: Vec::new(),
            failure: None,
            retry_of: None,
            attempt: 1,
            log: Vec::new(),
        }
    }

    /// Latest run recorded for a stage
    pub fn last_run(&self, stage: &str) -> Option<&StageRun> {
        self.stage_runs.iter().rev().find(|r| r.stage == stage)
    }

    /// Latest run of every stage that has one. Within a task these are
    /// final: a stage that failed after its retries stays failed when the
    /// task is resumed.
    pub fn settled_runs(&self) -> BTreeMap<String, StageRun> {
        let mut latest: BTreeMap<String, StageRun> = BTreeMap::new();
        for run in &self.stage_runs {
            latest.insert(run.stage.clone(), run.clone());
        }
        latest
    }

    pub fn is_approved(&self, stage: &str) -> bool {
        self.approvals.iter().any(|a| a.stage == stage)
    }

    pub fn approved_stages(&self) -> BTreeSet<&str> {
        self.approvals.iter().map(|a| a.stage.as_str()).collect()
    }

    /// Whether the auto-resume logic may pick this task up
    pub fn auto_resumable(&self) -> bool {
        self.status == Status::Paused
            && self
                .pause
                .as_ref()
                .map(|p| p.reason.auto_resumable())
                .unwrap_or(false)
    }

    /// Build the fresh attempt that retries this (terminal) task
    pub fn retry_attempt(&self, new_id: &str) -> Task {
        let mut task = Task::new(new_id, &self.description, &self.workflow);
        task.priority = self.priority;
        task.autonomy = self.autonomy;
        task.retry_of = Some(self.id.clone());
        task.attempt = self.attempt + 1;
        task
    }
}

/// Generate a task id from a description: lowercase, dashes, at most 32 chars
pub fn slugify(description: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for ch in description.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= 32 {
            break;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}
