//! Workflow loading
//!
//! Workflows live as YAML files in `<dir>/workflows/<name>.yaml`. A graph is
//! loaded once when a task is admitted and never re-read while that task
//! runs.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use walkdir::WalkDir;

use super::graph::{WorkflowDef, WorkflowGraph};
use super::WorkflowError;

/// Directory name under the project dir for workflow files
pub const WORKFLOWS_DIR: &str = "workflows";

/// Workflow installed by `init`
pub const DEFAULT_WORKFLOW_YAML: &str = r#"name: default
description: Plan, implement, test and review a change
stages:
  - name: plan
    agent: planner
  - name: implement
    agent: coder
    depends_on: [plan]
    retries: 1
    timeout: 1800
  - name: test
    agent: tester
    depends_on: [implement]
  - name: review
    agent: reviewer
    depends_on: [implement]
    approval: true
  - name: fix
    agent: coder
    depends_on: [test, review]
    condition: "test.passed == false || review.approved == false"
"#;

/// Source of validated workflow graphs
pub trait WorkflowLoader: Send + Sync {
    fn load(&self, name: &str) -> Result<WorkflowGraph, WorkflowError>;
}

/// Parse and validate one YAML workflow definition
pub fn parse_workflow(
    name: &str,
    yaml: &str,
    default_timeout: Duration,
) -> Result<WorkflowGraph, WorkflowError> {
    let def: WorkflowDef = serde_yaml::from_str(yaml).map_err(|e| WorkflowError::Parse {
        name: name.to_string(),
        message: e.to_string(),
    })?;
    WorkflowGraph::from_def(def, default_timeout)
}

pub fn workflows_dir(dir: &Path) -> PathBuf {
    dir.join(WORKFLOWS_DIR)
}

/// Write the default workflow unless one already exists
pub fn install_default(dir: &Path) -> std::io::Result<bool> {
    let wf_dir = workflows_dir(dir);
    let path = wf_dir.join("default.yaml");
    if path.exists() {
        return Ok(false);
    }
    fs::create_dir_all(&wf_dir)?;
    fs::write(&path, DEFAULT_WORKFLOW_YAML)?;
    Ok(true)
}

/// Loads workflows from the project's `workflows/` directory
#[derive(Debug, Clone)]
pub struct DirWorkflowLoader {
    dir: PathBuf,
    default_timeout: Duration,
}

impl DirWorkflowLoader {
    pub fn new(project_dir: &Path, default_timeout: Duration) -> Self {
        Self {
            dir: workflows_dir(project_dir),
            default_timeout,
        }
    }

    fn path_for(&self, name: &str) -> Option<PathBuf> {
        ["yaml", "yml"]
            .iter()
            .map(|ext| self.dir.join(format!("{}.{}", name, ext)))
            .find(|p| p.is_file())
    }

    /// Names of every workflow file, sorted
    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = WalkDir::new(&self.dir)
            .max_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let path = e.path();
                match path.extension().and_then(|x| x.to_str()) {
                    Some("yaml") | Some("yml") => path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .map(str::to_string),
                    _ => None,
                }
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

impl WorkflowLoader for DirWorkflowLoader {
    fn load(&self, name: &str) -> Result<WorkflowGraph, WorkflowError> {
        let path = self
            .path_for(name)
            .ok_or_else(|| WorkflowError::NotFound(name.to_string()))?;
        let yaml = fs::read_to_string(&path).map_err(|e| WorkflowError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        parse_workflow(name, &yaml, self.default_timeout)
    }
}

/// In-memory workflows, for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryWorkflowLoader {
    graphs: RwLock<HashMap<String, Result<WorkflowGraph, WorkflowError>>>,
}

impl MemoryWorkflowLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, graph: WorkflowGraph) {
        if let Ok(mut map) = self.graphs.write() {
            map.insert(graph.name().to_string(), Ok(graph));
        }
    }

    /// Register a definition as-is; validation errors surface on `load`
    pub fn insert_def(&self, def: WorkflowDef, default_timeout: Duration) {
        let name = def.name.clone();
        let result = WorkflowGraph::from_def(def, default_timeout);
        if let Ok(mut map) = self.graphs.write() {
            map.insert(name, result);
        }
    }
}

impl WorkflowLoader for MemoryWorkflowLoader {
    fn load(&self, name: &str) -> Result<WorkflowGraph, WorkflowError> {
        let map = self
            .graphs
            .read()
            .map_err(|_| WorkflowError::NotFound(name.to_string()))?;
        map.get(name)
            .cloned()
            .unwrap_or_else(|| Err(WorkflowError::NotFound(name.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_workflow_is_valid() {
        let graph =
            parse_workflow("default", DEFAULT_WORKFLOW_YAML, Duration::from_secs(600)).unwrap();
        assert_eq!(graph.len(), 5);
        assert_eq!(graph.topological_order()[0], "plan");
        assert_eq!(
            graph.stage("implement").unwrap().timeout,
            Duration::from_secs(1800)
        );
        assert!(graph.stage("review").unwrap().approval);
        assert!(graph.stage("fix").unwrap().condition.is_some());
    }

    #[test]
    fn test_dir_loader() {
        let temp_dir = TempDir::new().unwrap();
        assert!(install_default(temp_dir.path()).unwrap());
        assert!(!install_default(temp_dir.path()).unwrap());
        fs::write(
            workflows_dir(temp_dir.path()).join("quick.yml"),
            "name: quick\nstages:\n  - name: only\n    agent: coder\n",
        )
        .unwrap();

        let loader = DirWorkflowLoader::new(temp_dir.path(), Duration::from_secs(60));
        assert_eq!(loader.available(), vec!["default", "quick"]);
        assert_eq!(loader.load("quick").unwrap().len(), 1);
        assert!(matches!(
            loader.load("missing"),
            Err(WorkflowError::NotFound(_))
        ));
    }

    #[test]
    fn test_cyclic_file_is_rejected() {
        let yaml = "name: loop\nstages:\n  - name: a\n    agent: x\n    depends_on: [b]\n  - name: b\n    agent: x\n    depends_on: [a]\n";
        assert!(matches!(
            parse_workflow("loop", yaml, Duration::from_secs(60)),
            Err(WorkflowError::Cycle { .. })
        ));
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(
            parse_workflow("bad", "stages: [", Duration::from_secs(60)),
            Err(WorkflowError::Parse { .. })
        ));
    }

    #[test]
    fn test_memory_loader_surfaces_validation_errors() {
        let loader = MemoryWorkflowLoader::new();
        let yaml = "name: loop\nstages:\n  - name: a\n    agent: x\n    depends_on: [a]\n";
        let def: WorkflowDef = serde_yaml::from_str(yaml).unwrap();
        loader.insert_def(def, Duration::from_secs(60));
        assert!(matches!(
            loader.load("loop"),
            Err(WorkflowError::Cycle { .. })
        ));
    }
}
