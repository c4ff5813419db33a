pub mod add;
pub mod approve;
pub mod cancel;
pub mod capacity;
pub mod daemon;
pub mod init;
pub mod list;
pub mod pause;
pub mod queue;
pub mod reject;
pub mod resume;
pub mod retry;
pub mod show;
pub mod workflow;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::path::Path;

use nightshift::capacity::CapacityModel;
use nightshift::config::Config;
use nightshift::store::{FileTaskStore, tasks_path};

/// Fail unless `init` has been run in `dir`
pub fn ensure_initialized(dir: &Path) -> Result<()> {
    if !tasks_path(dir).exists() {
        anyhow::bail!("nightshift not initialized. Run 'nightshift init' first.");
    }
    Ok(())
}

pub fn open_store(dir: &Path) -> Result<FileTaskStore> {
    ensure_initialized(dir)?;
    Ok(FileTaskStore::new(dir))
}

/// Capacity model backed by the ledger the daemon writes
pub fn open_capacity(dir: &Path, config: &Config) -> Result<CapacityModel> {
    CapacityModel::open(dir, &config.capacity).context("Failed to load capacity ledger")
}

pub fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
