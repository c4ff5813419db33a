//! Workflow definitions and execution.
//!
//! - [`graph`]: validated stage DAGs
//! - [`condition`]: the stage condition language
//! - [`loader`]: YAML workflow files under `workflows/`
//! - [`engine`]: runs one task through its graph

pub mod condition;
pub mod engine;
pub mod graph;
pub mod loader;

use thiserror::Error;

pub use condition::{Condition, StageOutputs};
pub use engine::{RunOutcome, WorkflowEngine};
pub use graph::{Stage, StageDef, WorkflowDef, WorkflowGraph};
pub use loader::{DirWorkflowLoader, MemoryWorkflowLoader, WorkflowLoader};

/// Configuration errors: a workflow that fails any of these never runs
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("workflow '{0}' has no stages")]
    Empty(String),

    #[error("workflow '{workflow}': stage '{stage}' is defined more than once")]
    DuplicateStage { workflow: String, stage: String },

    #[error("workflow '{workflow}': stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency {
        workflow: String,
        stage: String,
        dependency: String,
    },

    #[error("workflow '{workflow}' has a dependency cycle: {}", path.join(" -> "))]
    Cycle { workflow: String, path: Vec<String> },

    #[error("workflow '{workflow}': invalid condition on stage '{stage}': {message}")]
    Condition {
        workflow: String,
        stage: String,
        message: String,
    },

    #[error(
        "workflow '{workflow}': condition on stage '{stage}' reads '{reference}', which is not upstream of it"
    )]
    ConditionReference {
        workflow: String,
        stage: String,
        reference: String,
    },

    #[error("workflow '{workflow}': stage '{stage}' has a zero timeout")]
    InvalidTimeout { workflow: String, stage: String },

    #[error("workflow '{0}' not found")]
    NotFound(String),

    #[error("failed to parse workflow '{name}': {message}")]
    Parse { name: String, message: String },

    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },
}
