use anyhow::{Context, Result};
use std::path::Path;

use nightshift::state::TransitionMeta;
use nightshift::store::{TaskStore, unique_id};
use nightshift::task::Status;

/// Queue a fresh attempt of a terminal task. The original record is left
/// as it is.
pub fn run(dir: &Path, id: &str, json: bool) -> Result<()> {
    let store = super::open_store(dir)?;
    let original = store.get_or_err(id)?;

    if !original.status.is_terminal() {
        anyhow::bail!(
            "Task '{}' is {}. Only completed, failed or cancelled tasks can be retried.",
            id,
            original.status
        );
    }

    let existing = store.list().context("Failed to load tasks")?;
    let base = format!("{}-retry", original.retry_of.as_deref().unwrap_or(id));
    let new_id = unique_id(&existing, &base);

    let attempt = original.retry_attempt(&new_id);
    store.insert(attempt).context("Failed to save retry task")?;
    let task = store.apply_transition(
        &new_id,
        Status::Pending,
        Status::Queued,
        TransitionMeta::reason(format!("retry of {}", id)),
    )?;

    if json {
        super::print_json(&task)?;
    } else {
        println!(
            "Retrying '{}' as '{}' (attempt {})",
            id, task.id, task.attempt
        );
    }
    Ok(())
}
