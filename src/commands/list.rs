use anyhow::{Context, Result};
use std::path::Path;

use nightshift::config::Config;
use nightshift::query;
use nightshift::task::Status;

pub fn run(dir: &Path, status_filter: Option<&str>, json: bool) -> Result<()> {
    let store = super::open_store(dir)?;
    let config = Config::load(dir)?;
    let capacity = super::open_capacity(dir, &config)?;

    let status = status_filter
        .map(|s| s.parse::<Status>().map_err(anyhow::Error::msg))
        .transpose()?;

    let report = query::task_list(&store, &capacity, status, super::local_now())
        .context("Failed to load tasks")?;

    if json {
        return super::print_json(&report);
    }

    if report.tasks.is_empty() {
        println!("No tasks found");
    } else {
        for task in &report.tasks {
            let marker = match task.status {
                Status::Pending => "[.]",
                Status::Queued => "[ ]",
                Status::Planning | Status::InProgress => "[~]",
                Status::WaitingApproval => "[?]",
                Status::Paused => "[=]",
                Status::Completed => "[x]",
                Status::Failed => "[F]",
                Status::Cancelled => "[C]",
            };
            let mut extra = String::new();
            if let Some(ref stage) = task.current_stage {
                extra.push_str(&format!(" @{}", stage));
            }
            if let Some(reason) = task.pause_reason {
                extra.push_str(&format!(" ({})", reason));
            }
            println!(
                "{} {} [{}] - {}{}",
                marker, task.id, task.priority, task.description, extra
            );
        }
    }

    let counts: Vec<String> = report
        .counts
        .iter()
        .map(|(status, n)| format!("{} {}", n, status))
        .collect();
    if !counts.is_empty() {
        println!();
        println!("{}", counts.join(", "));
    }
    println!(
        "Capacity: {} mode, ${:.2} of ${:.2} spent ({:.0}%)",
        report.capacity.mode,
        report.capacity.spent,
        report.capacity.daily_budget,
        report.capacity.usage_percent
    );
    Ok(())
}
