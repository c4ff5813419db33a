//! nightshift: a capacity-aware scheduler for multi-stage agent workflows.
//!
//! A daemon polls the task store, admits tasks while today's spend stays
//! under the threshold of the current day/night/off-hours window, and drives
//! each admitted task through a DAG of agent stages.

pub mod capacity;
pub mod config;
pub mod error;
pub mod logging;
pub mod query;
pub mod service;
pub mod state;
pub mod store;
pub mod task;
pub mod workflow;

#[cfg(any(test, feature = "test-support"))]
pub mod test_helpers;

pub use capacity::{
    Admission, AdmissionController, CapacityModel, CapacitySnapshot, Mode, TimeWindowPolicy,
};
pub use config::Config;
pub use error::DaemonError;
pub use service::{AgentExecutor, CommandExecutor, EventBus};
pub use state::{TransitionMeta, apply_transition, can_transition};
pub use store::{FileTaskStore, MemoryTaskStore, TaskStore};
pub use task::{AutonomyLevel, PauseReason, Priority, Status, Task, Usage};
pub use workflow::{RunOutcome, WorkflowEngine, WorkflowGraph, WorkflowLoader};
