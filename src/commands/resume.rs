use anyhow::Result;
use std::path::Path;

use nightshift::state::TransitionMeta;
use nightshift::store::TaskStore;
use nightshift::task::Status;

pub fn run(dir: &Path, id: &str, reason: Option<&str>, json: bool) -> Result<()> {
    let store = super::open_store(dir)?;
    let current = store.get_or_err(id)?;

    let Some(ref pause) = current.pause else {
        anyhow::bail!("Cannot resume task '{}': status is {}", id, current.status);
    };
    let target = pause.resume_target();

    let task = store.apply_transition(
        id,
        Status::Paused,
        target,
        TransitionMeta::reason(reason.unwrap_or("resumed by operator")),
    )?;

    if json {
        super::print_json(&task)?;
    } else {
        println!("Resumed task '{}' ({})", id, target);
    }
    Ok(())
}
