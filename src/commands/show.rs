use anyhow::Result;
use std::path::Path;

use nightshift::config::Config;
use nightshift::query;

pub fn run(dir: &Path, id: &str, json: bool) -> Result<()> {
    let store = super::open_store(dir)?;
    let config = Config::load(dir)?;
    let capacity = super::open_capacity(dir, &config)?;

    let report = query::task_status(&store, &capacity, id, super::local_now())?;
    if json {
        return super::print_json(&report);
    }

    let task = &report.task;
    println!("Task: {}", task.id);
    println!("Description: {}", task.description);
    println!("Status: {}", task.status);
    println!("Workflow: {}", task.workflow);
    println!("Priority: {}", task.priority);
    println!("Autonomy: {:?}", task.autonomy);
    if let Some(ref stage) = task.current_stage {
        println!("Current stage: {}", stage);
    }
    if let Some(ref stage) = task.awaiting_stage {
        println!("Awaiting approval: {}", stage);
    }
    if let Some(ref pause) = task.pause {
        print!("Paused: {} (from {})", pause.reason, pause.paused_from);
        if let Some(at) = pause.resume_at {
            print!(", resumes after {}", at.to_rfc3339());
        }
        println!();
    }
    if let Some(ref failure) = task.failure {
        match failure.stage {
            Some(ref stage) => println!(
                "Failure: stage '{}' after {} attempt(s): {}",
                stage, failure.attempts, failure.reason
            ),
            None => println!("Failure: {}", failure.reason),
        }
    }
    if let Some(ref original) = task.retry_of {
        println!("Retry of: {} (attempt {})", original, task.attempt);
    }
    println!(
        "Usage: {} tokens, ${:.4}",
        task.usage.tokens(),
        task.usage.cost
    );
    println!("Created: {}", task.created_at.to_rfc3339());

    if !task.stage_runs.is_empty() {
        println!();
        println!("Stages:");
        for run in &task.stage_runs {
            let mut line = format!("  {} ({}): {}", run.stage, run.agent, run.outcome);
            if run.attempts > 1 {
                line.push_str(&format!(", {} attempts", run.attempts));
            }
            if let Some(ref error) = run.error {
                line.push_str(&format!(" - {}", error));
            }
            println!("{}", line);
        }
    }

    if !task.approvals.is_empty() {
        println!();
        println!("Approvals:");
        for approval in &task.approvals {
            println!(
                "  {} by {} at {}",
                approval.stage,
                approval.approver.as_deref().unwrap_or("unknown"),
                approval.approved_at.to_rfc3339()
            );
        }
    }

    if !task.log.is_empty() {
        println!();
        println!("Log:");
        for entry in &task.log {
            let actor = entry
                .actor
                .as_ref()
                .map(|a| format!(" [{}]", a))
                .unwrap_or_default();
            println!("  {}{} {}", entry.timestamp.to_rfc3339(), actor, entry.message);
        }
    }
    Ok(())
}
