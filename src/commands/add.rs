use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;

use nightshift::config::Config;
use nightshift::state::TransitionMeta;
use nightshift::store::{TaskStore, unique_id};
use nightshift::task::{AutonomyLevel, Priority, Status, Task, slugify};
use nightshift::workflow::{DirWorkflowLoader, WorkflowLoader};

pub struct AddOptions<'a> {
    pub workflow: Option<&'a str>,
    pub priority: Option<&'a str>,
    pub autonomy: Option<&'a str>,
    pub id: Option<&'a str>,
    /// Leave the task pending instead of queueing it
    pub hold: bool,
}

pub fn run(dir: &Path, description: &str, options: AddOptions<'_>, json: bool) -> Result<()> {
    let store = super::open_store(dir)?;
    let config = Config::load(dir)?;

    if description.trim().is_empty() {
        anyhow::bail!("Task description cannot be empty");
    }

    let workflow = options
        .workflow
        .unwrap_or(&config.workflow.default_workflow)
        .to_string();
    // Reject a broken workflow now rather than when the daemon picks the task up
    DirWorkflowLoader::new(dir, Duration::from_secs(config.workflow.default_timeout))
        .load(&workflow)
        .with_context(|| format!("Workflow '{}' is not usable", workflow))?;

    let priority = match options.priority {
        Some(p) => p.parse::<Priority>().map_err(anyhow::Error::msg)?,
        None => Priority::default(),
    };
    let autonomy = match options.autonomy {
        Some(a) => a.parse::<AutonomyLevel>().map_err(anyhow::Error::msg)?,
        None => AutonomyLevel::default(),
    };

    let existing = store.list().context("Failed to load tasks")?;
    let id = match options.id {
        Some(id) => {
            if existing.iter().any(|t| t.id == id) {
                anyhow::bail!("Task with ID '{}' already exists", id);
            }
            id.to_string()
        }
        None => unique_id(&existing, &slugify(description)),
    };

    let mut task = Task::new(&id, description, &workflow);
    task.priority = priority;
    task.autonomy = autonomy;
    store.insert(task).context("Failed to save task")?;

    let task = if options.hold {
        store.get_or_err(&id)?
    } else {
        store.apply_transition(
            &id,
            Status::Pending,
            Status::Queued,
            TransitionMeta::reason("submitted"),
        )?
    };

    if json {
        super::print_json(&task)?;
    } else {
        println!("Added task: {} ({})", task.id, task.status);
        println!("  workflow: {}, priority: {}", task.workflow, task.priority);
        if options.hold {
            println!("  held; run 'nightshift queue {}' to schedule it", task.id);
        }
    }
    Ok(())
}
