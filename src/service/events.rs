//! Outbound event bus
//!
//! The engine, the admission controller and the daemon publish lifecycle
//! events here; whoever subscribes (the daemon's log consumer, a UI layer)
//! gets every event sent after it subscribed. Publishing never blocks and
//! never fails when nobody is listening.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::task::{PauseReason, Status, Usage};

/// Buffered events per subscriber before the slowest one starts lagging
const EVENT_BUFFER: usize = 1024;

/// Stage lifecycle states carried by `task:stage-changed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageState {
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum Event {
    #[serde(rename = "task:stage-changed")]
    StageChanged {
        task_id: String,
        stage: String,
        state: StageState,
        attempt: u32,
    },
    #[serde(rename = "task:completed")]
    TaskCompleted { task_id: String },
    #[serde(rename = "task:failed")]
    TaskFailed {
        task_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
        reason: String,
        attempts: u32,
    },
    #[serde(rename = "task:paused")]
    TaskPaused {
        task_id: String,
        reason: PauseReason,
    },
    #[serde(rename = "task:resumed")]
    TaskResumed { task_id: String, to: Status },
    #[serde(rename = "usage:updated")]
    UsageUpdated {
        task_id: String,
        usage: Usage,
        daily_cost: f64,
        usage_fraction: f64,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::StageChanged { .. } => "task:stage-changed",
            Event::TaskCompleted { .. } => "task:completed",
            Event::TaskFailed { .. } => "task:failed",
            Event::TaskPaused { .. } => "task:paused",
            Event::TaskResumed { .. } => "task:resumed",
            Event::UsageUpdated { .. } => "usage:updated",
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            Event::StageChanged { task_id, .. }
            | Event::TaskCompleted { task_id }
            | Event::TaskFailed { task_id, .. }
            | Event::TaskPaused { task_id, .. }
            | Event::TaskResumed { task_id, .. }
            | Event::UsageUpdated { task_id, .. } => task_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn emit(&self, event: Event) {
        // Ignored if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

/// Forward every event to the tracing log until the bus closes
pub fn spawn_event_logger(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let payload = serde_json::to_string(&event).unwrap_or_default();
                    tracing::info!(
                        target: "nightshift::events",
                        event = event.name(),
                        task = event.task_id(),
                        %payload
                    );
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
