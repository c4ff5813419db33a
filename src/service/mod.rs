//! Daemon-side services: agent execution, events, the supervisor loop and
//! the watchdog that keeps it alive.

pub mod events;
pub mod executor;
pub mod health;
pub mod pidfile;
pub mod supervisor;
pub mod watchdog;

pub use events::{Event, EventBus, StageState, spawn_event_logger};
pub use executor::{
    AgentConfig, AgentError, AgentExecutor, AgentSettings, CommandExecutor, StageReport,
    StageRequest, TemplateVars,
};
pub use health::{DaemonHealthRecord, MemorySnapshot, RestartEvent, TaskCounters};
pub use pidfile::{DaemonLock, Heartbeat, PidFile, PidStatus};
pub use supervisor::{DaemonOptions, Supervisor, run_daemon};
pub use watchdog::{Liveness, RestartBackoff, run_watchdog};
