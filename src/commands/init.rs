use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use nightshift::config::Config;
use nightshift::service::executor::install_starter_agents;
use nightshift::service::pidfile::service_dir;
use nightshift::store::tasks_path;
use nightshift::workflow::loader::install_default;

/// Default content for .nightshift/.gitignore
const GITIGNORE_CONTENT: &str = r#"# nightshift gitignore
# Daemon runtime files (pid, lock, heartbeat, logs, ledger)
service/
"#;

pub fn run(dir: &Path, json: bool) -> Result<()> {
    let tasks = tasks_path(dir);
    if tasks.exists() {
        anyhow::bail!("nightshift already initialized at {}", dir.display());
    }

    fs::create_dir_all(dir).context("Failed to create project directory")?;
    fs::write(&tasks, "").context("Failed to create tasks.jsonl")?;
    fs::create_dir_all(service_dir(dir)).context("Failed to create service directory")?;
    fs::write(dir.join(".gitignore"), GITIGNORE_CONTENT).context("Failed to create .gitignore")?;

    Config::init(dir)?;
    let workflow = install_default(dir).context("Failed to write default workflow")?;
    let agents = install_starter_agents(dir).context("Failed to write starter agents")?;

    if json {
        super::print_json(&serde_json::json!({
            "initialized": dir,
            "default_workflow": workflow,
            "agents": agents,
        }))?;
    } else {
        println!("Initialized nightshift at {}", dir.display());
        if workflow {
            println!("  wrote workflows/default.yaml");
        }
        if agents > 0 {
            println!("  wrote {} starter agent(s) under agents/", agents);
        }
    }
    Ok(())
}
