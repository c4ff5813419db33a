//! Workflow graphs
//!
//! A [`WorkflowDef`] is the raw, deserialized definition. Converting it into
//! a [`WorkflowGraph`] validates everything that can be known before a stage
//! runs: stage names are unique, every dependency exists, the graph is
//! acyclic, conditions parse and only read from upstream stages. A graph
//! that fails any of these checks is a configuration error and never
//! executes.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::condition::Condition;
use super::WorkflowError;

/// One stage as written in a workflow file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDef {
    pub name: String,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Seconds; falls back to the configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retries: u32,
    /// Human gate before this stage runs
    #[serde(default)]
    pub approval: bool,
    /// Static input passed to the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub stages: Vec<StageDef>,
}

/// A validated stage
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub agent: String,
    pub depends_on: Vec<String>,
    pub condition: Option<Condition>,
    pub timeout: Duration,
    pub retries: u32,
    pub approval: bool,
    pub input: serde_json::Value,
}

impl Stage {
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Immutable, validated DAG of stages. Stages are stored in topological
/// order.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    name: String,
    description: Option<String>,
    stages: Vec<Stage>,
    index: HashMap<String, usize>,
}

impl WorkflowGraph {
    pub fn from_def(def: WorkflowDef, default_timeout: Duration) -> Result<Self, WorkflowError> {
        let workflow = def.name.clone();
        if def.stages.is_empty() {
            return Err(WorkflowError::Empty(workflow));
        }

        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
        for (i, stage) in def.stages.iter().enumerate() {
            if nodes.insert(stage.name.as_str(), graph.add_node(i)).is_some() {
                return Err(WorkflowError::DuplicateStage {
                    workflow,
                    stage: stage.name.clone(),
                });
            }
        }

        for stage in &def.stages {
            let to = nodes[stage.name.as_str()];
            for dep in &stage.depends_on {
                let from = nodes
                    .get(dep.as_str())
                    .ok_or_else(|| WorkflowError::UnknownDependency {
                        workflow: workflow.clone(),
                        stage: stage.name.clone(),
                        dependency: dep.clone(),
                    })?;
                graph.add_edge(*from, to, ());
            }
        }

        let order = toposort(&graph, None).map_err(|_| WorkflowError::Cycle {
            workflow: workflow.clone(),
            path: find_cycle(&def.stages),
        })?;

        let mut stages = Vec::with_capacity(def.stages.len());
        for node in order {
            let def_stage = &def.stages[graph[node]];
            let timeout = def_stage
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(default_timeout);
            if timeout.is_zero() {
                return Err(WorkflowError::InvalidTimeout {
                    workflow,
                    stage: def_stage.name.clone(),
                });
            }
            let condition = match def_stage.condition.as_deref().map(str::trim) {
                None | Some("") => None,
                Some(src) => Some(Condition::parse(src).map_err(|e| {
                    WorkflowError::Condition {
                        workflow: workflow.clone(),
                        stage: def_stage.name.clone(),
                        message: e.to_string(),
                    }
                })?),
            };
            stages.push(Stage {
                name: def_stage.name.clone(),
                agent: def_stage.agent.clone(),
                depends_on: def_stage.depends_on.clone(),
                condition,
                timeout,
                retries: def_stage.retries,
                approval: def_stage.approval,
                input: def_stage.input.clone().unwrap_or(serde_json::Value::Null),
            });
        }

        let index = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();
        let graph = Self {
            name: def.name,
            description: def.description,
            stages,
            index,
        };

        // Conditions may only read outputs of stages guaranteed to finish first
        for stage in &graph.stages {
            let Some(ref condition) = stage.condition else {
                continue;
            };
            let upstream = graph.ancestors(&stage.name);
            for referenced in condition.referenced_stages() {
                if !upstream.contains(referenced) {
                    return Err(WorkflowError::ConditionReference {
                        workflow: graph.name.clone(),
                        stage: stage.name.clone(),
                        reference: referenced.to_string(),
                    });
                }
            }
        }

        Ok(graph)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Stages in topological order
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.index.get(name).map(|&i| &self.stages[i])
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn topological_order(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Stages that list `name` as a direct dependency
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.depends_on.iter().any(|d| d == name))
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Transitive dependencies of a stage
    pub fn ancestors(&self, name: &str) -> HashSet<&str> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = self
            .stage(name)
            .map(|s| s.depends_on.iter().map(String::as_str).collect())
            .unwrap_or_default();
        while let Some(current) = stack.pop() {
            if seen.insert(current)
                && let Some(stage) = self.stage(current)
            {
                stack.extend(stage.depends_on.iter().map(String::as_str));
            }
        }
        seen
    }
}

/// Depth-first search for one dependency cycle, returned as the path of
/// stage names that closes on itself (`a -> b -> a`).
fn find_cycle(stages: &[StageDef]) -> Vec<String> {
    let deps: HashMap<&str, &[String]> = stages
        .iter()
        .map(|s| (s.name.as_str(), s.depends_on.as_slice()))
        .collect();
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for stage in stages {
        if !visited.contains(stage.name.as_str())
            && let Some(cycle) = visit(&deps, &stage.name, &mut visited, &mut rec_stack, &mut path)
        {
            return cycle;
        }
    }
    Vec::new()
}

fn visit<'a>(
    deps: &HashMap<&'a str, &'a [String]>,
    node: &'a str,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    for dep in deps.get(node).copied().unwrap_or_default() {
        let dep = dep.as_str();
        if !visited.contains(dep) {
            if let Some(cycle) = visit(deps, dep, visited, rec_stack, path) {
                return Some(cycle);
            }
        } else if rec_stack.contains(dep)
            && let Some(pos) = path.iter().position(|x| *x == dep)
        {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(dep.to_string());
            return Some(cycle);
        }
    }

    path.pop();
    rec_stack.remove(node);
    None
}
