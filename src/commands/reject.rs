use anyhow::Result;
use std::path::Path;

use nightshift::state::TransitionMeta;
use nightshift::store::TaskStore;
use nightshift::task::Status;

/// Reject a task held at an approval gate; the task is cancelled
pub fn run(
    dir: &Path,
    id: &str,
    reason: Option<&str>,
    actor: Option<&str>,
    json: bool,
) -> Result<()> {
    let store = super::open_store(dir)?;
    let current = store.get_or_err(id)?;

    if current.status != Status::WaitingApproval {
        anyhow::bail!(
            "Cannot reject task '{}': status is {}, expected waiting-approval",
            id,
            current.status
        );
    }

    let message = match reason {
        Some(r) => format!("rejected: {}", r),
        None => "rejected".to_string(),
    };
    let task = store.apply_transition(
        id,
        Status::WaitingApproval,
        Status::Cancelled,
        TransitionMeta::reason(message).with_actor(actor.map(String::from)),
    )?;

    if json {
        super::print_json(&task)?;
    } else {
        println!("Rejected task '{}'", id);
        if let Some(r) = reason {
            println!("Reason: {}", r);
        }
    }
    Ok(())
}
