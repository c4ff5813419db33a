use anyhow::Result;
use std::path::Path;

use nightshift::state::TransitionMeta;
use nightshift::store::TaskStore;
use nightshift::task::Status;

/// Cancel a task. A running daemon notices the new status on its next poll
/// and aborts the task's in-flight stages.
pub fn run(dir: &Path, id: &str, reason: Option<&str>, json: bool) -> Result<()> {
    let store = super::open_store(dir)?;
    let current = store.get_or_err(id)?;

    let task = store.apply_transition(
        id,
        current.status,
        Status::Cancelled,
        TransitionMeta::reason(reason.unwrap_or("cancelled by operator")),
    )?;

    if json {
        super::print_json(&task)?;
    } else {
        println!("Cancelled task '{}' (was {})", id, current.status);
    }
    Ok(())
}
