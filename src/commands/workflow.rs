use anyhow::Result;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

use nightshift::config::Config;
use nightshift::workflow::{DirWorkflowLoader, WorkflowLoader};

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    order: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Load and validate one workflow, or every workflow under `workflows/`
pub fn run_check(dir: &Path, name: Option<&str>, json: bool) -> Result<()> {
    let config = Config::load(dir)?;
    let loader = DirWorkflowLoader::new(dir, Duration::from_secs(config.workflow.default_timeout));

    let names = match name {
        Some(n) => vec![n.to_string()],
        None => loader.available(),
    };
    if names.is_empty() {
        anyhow::bail!("No workflows found under {}", dir.join("workflows").display());
    }

    let results: Vec<CheckResult> = names
        .into_iter()
        .map(|name| match loader.load(&name) {
            Ok(graph) => CheckResult {
                name,
                valid: true,
                order: graph
                    .topological_order()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                error: None,
            },
            Err(e) => CheckResult {
                name,
                valid: false,
                order: Vec::new(),
                error: Some(e.to_string()),
            },
        })
        .collect();
    let invalid = results.iter().filter(|r| !r.valid).count();

    if json {
        super::print_json(&results)?;
    } else {
        for result in &results {
            match result.error {
                None => println!("ok    {} ({})", result.name, result.order.join(" -> ")),
                Some(ref e) => println!("error {}: {}", result.name, e),
            }
        }
    }

    if invalid > 0 {
        anyhow::bail!("{} workflow(s) failed validation", invalid);
    }
    Ok(())
}
