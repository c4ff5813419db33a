//! Approve command - release a task held at an approval gate
//!
//! The approval is recorded against the gated stage; the daemon picks the
//! task up again on its next poll and dispatches that stage.

use anyhow::Result;
use std::path::Path;

use nightshift::state::TransitionMeta;
use nightshift::store::TaskStore;
use nightshift::task::Status;

pub fn run(dir: &Path, id: &str, actor: Option<&str>, json: bool) -> Result<()> {
    let store = super::open_store(dir)?;
    let current = store.get_or_err(id)?;

    if current.status != Status::WaitingApproval {
        anyhow::bail!(
            "Cannot approve task '{}': status is {}, expected waiting-approval",
            id,
            current.status
        );
    }
    let stage = current.awaiting_stage.clone().unwrap_or_default();

    let mut meta = TransitionMeta::reason("approved").with_actor(actor.map(String::from));
    if !stage.is_empty() {
        meta = meta.with_stage(stage.as_str());
    }
    let task = store.apply_transition(id, Status::WaitingApproval, Status::InProgress, meta)?;

    if json {
        super::print_json(&task)?;
    } else if stage.is_empty() {
        println!("Approved task '{}'", id);
    } else {
        println!("Approved stage '{}' of task '{}'", stage, id);
    }
    Ok(())
}
