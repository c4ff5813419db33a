use anyhow::Result;
use std::path::Path;

use nightshift::config::Config;

pub fn run(dir: &Path, json: bool) -> Result<()> {
    let config = Config::load(dir)?;
    let capacity = super::open_capacity(dir, &config)?;
    let snapshot = capacity.snapshot(super::local_now());

    if json {
        return super::print_json(&snapshot);
    }

    println!("Mode: {} (threshold {:.0}%)", snapshot.mode, snapshot.threshold * 100.0);
    println!(
        "Spent today: ${:.2} of ${:.2} ({:.1}%), {} tokens",
        snapshot.spent, snapshot.daily_budget, snapshot.usage_percent, snapshot.tokens
    );
    println!(
        "Projected with ${:.2} stage reserve: {:.1}%",
        snapshot.reserve,
        snapshot.projected_fraction * 100.0
    );
    if snapshot.auto_paused {
        println!("New work: held back");
        if snapshot.usage_fraction < snapshot.threshold {
            println!(
                "  spend alone is {:.1}%; the stage reserve brings it to the {:.0}% threshold",
                snapshot.usage_fraction * 100.0,
                snapshot.threshold * 100.0
            );
        }
    } else {
        println!("New work: admitted");
    }
    if let Some(at) = snapshot.next_mode_switch {
        println!("Next mode switch: {}", at.format("%Y-%m-%d %H:%M"));
    }
    Ok(())
}
