use anyhow::Result;
use chrono::Utc;
use std::path::Path;

use nightshift::state::TransitionMeta;
use nightshift::store::TaskStore;
use nightshift::task::{PauseInfo, PauseReason, Status};

/// Pause a task on the operator's request. A running task lets its
/// in-flight stages finish before the daemon lets go of it.
pub fn run(dir: &Path, id: &str, reason: Option<&str>, json: bool) -> Result<()> {
    let store = super::open_store(dir)?;
    let current = store.get_or_err(id)?;

    if !matches!(
        current.status,
        Status::Queued | Status::Planning | Status::InProgress
    ) {
        anyhow::bail!(
            "Cannot pause task '{}': status is {}",
            id,
            current.status
        );
    }

    let mut meta = TransitionMeta::paused(PauseInfo::new(
        PauseReason::UserRequest,
        current.status,
        Utc::now(),
    ));
    meta.reason = reason.map(str::to_string);
    let task = store.apply_transition(id, current.status, Status::Paused, meta)?;

    if json {
        super::print_json(&task)?;
    } else {
        println!("Paused task '{}' (was {})", id, current.status);
    }
    Ok(())
}
