use anyhow::Result;
use std::path::Path;

use nightshift::state::TransitionMeta;
use nightshift::store::TaskStore;
use nightshift::task::Status;

/// Move a held (pending) task onto the queue
pub fn run(dir: &Path, id: &str, json: bool) -> Result<()> {
    let store = super::open_store(dir)?;
    let task = store.apply_transition(
        id,
        Status::Pending,
        Status::Queued,
        TransitionMeta::reason("queued by operator"),
    )?;

    if json {
        super::print_json(&task)?;
    } else {
        println!("Queued task '{}'", task.id);
    }
    Ok(())
}
