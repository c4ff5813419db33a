//! Daily usage ledger and capacity snapshots
//!
//! The ledger accumulates cost and tokens for the current local day and
//! starts over when the date changes. Usage updates and threshold reads go
//! through one mutex so an admission decision never observes a half-applied
//! update. When backed by a file the ledger is rewritten atomically after
//! every update so a restarted daemon keeps the day's spend.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::window::{Mode, ModeInfo, Thresholds, TimeWindowPolicy};
use super::CapacityError;
use crate::config::CapacityConfig;
use crate::task::{PauseReason, Usage};

/// Usage accumulated for one local calendar day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyLedger {
    pub date: NaiveDate,
    #[serde(default)]
    pub usage: Usage,
    pub updated_at: DateTime<Utc>,
}

impl DailyLedger {
    fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            usage: Usage::default(),
            updated_at: Utc::now(),
        }
    }
}

/// Point-in-time view of capacity, as reported by status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    pub at: NaiveDateTime,
    pub mode: Mode,
    pub threshold: f64,
    pub thresholds: Thresholds,
    pub daily_budget: f64,
    pub spent: f64,
    pub tokens: u64,
    /// `spent / daily_budget`, clamped to [0, 1]
    pub usage_fraction: f64,
    pub usage_percent: f64,
    /// Spend set aside for the next stage
    pub reserve: f64,
    /// `(spent + reserve) / daily_budget`, clamped to [0, 1]
    pub projected_fraction: f64,
    /// True when new work is held back
    pub auto_paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<PauseReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_mode_switch: Option<NaiveDateTime>,
}

impl CapacitySnapshot {
    /// New work is admitted strictly below the threshold
    pub fn admits(&self) -> bool {
        self.projected_fraction < self.threshold
    }
}

pub struct CapacityModel {
    policy: TimeWindowPolicy,
    daily_budget: f64,
    reserve: f64,
    ledger: Mutex<Option<DailyLedger>>,
    path: Option<PathBuf>,
}

impl CapacityModel {
    /// In-memory model; nothing is persisted
    pub fn new(config: &CapacityConfig) -> Self {
        Self {
            policy: TimeWindowPolicy::new(config),
            daily_budget: config.daily_budget,
            reserve: config.stage_reserve.max(0.0),
            ledger: Mutex::new(None),
            path: None,
        }
    }

    /// Model backed by `service/capacity.json` in the project directory
    pub fn open(dir: &Path, config: &CapacityConfig) -> Result<Self, CapacityError> {
        let path = ledger_path(dir);
        let ledger = load_ledger(&path)?;
        Ok(Self {
            policy: TimeWindowPolicy::new(config),
            daily_budget: config.daily_budget,
            reserve: config.stage_reserve.max(0.0),
            ledger: Mutex::new(ledger),
            path: Some(path),
        })
    }

    pub fn policy(&self) -> &TimeWindowPolicy {
        &self.policy
    }

    pub fn mode_at(&self, now: NaiveDateTime) -> ModeInfo {
        self.policy.mode_at(now)
    }

    /// Add usage to today's ledger and return the snapshot after the update
    pub fn record_usage(&self, now: NaiveDateTime, usage: &Usage) -> CapacitySnapshot {
        let mut guard = match self.ledger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let ledger = current_day(&mut guard, now.date());
        ledger.usage.add(usage);
        ledger.updated_at = Utc::now();
        let totals = ledger.usage;

        if let Some(ref path) = self.path
            && let Err(e) = save_ledger(path, ledger)
        {
            tracing::warn!(error = %e, "failed to persist capacity ledger");
        }

        self.build_snapshot(now, &totals)
    }

    /// Today's totals
    pub fn usage_today(&self, now: NaiveDateTime) -> Usage {
        let mut guard = match self.ledger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        current_day(&mut guard, now.date()).usage
    }

    pub fn snapshot(&self, now: NaiveDateTime) -> CapacitySnapshot {
        let usage = self.usage_today(now);
        self.build_snapshot(now, &usage)
    }

    fn build_snapshot(&self, now: NaiveDateTime, usage: &Usage) -> CapacitySnapshot {
        let info = self.policy.mode_at(now);
        let fraction = |cost: f64| {
            if self.daily_budget > 0.0 {
                (cost / self.daily_budget).clamp(0.0, 1.0)
            } else {
                1.0
            }
        };
        let usage_fraction = fraction(usage.cost);
        let projected_fraction = if self.reserve > 0.0 {
            fraction(usage.cost + self.reserve)
        } else {
            usage_fraction
        };
        let auto_paused = projected_fraction >= info.threshold;
        CapacitySnapshot {
            at: now,
            mode: info.mode,
            threshold: info.threshold,
            thresholds: info.thresholds,
            daily_budget: self.daily_budget,
            spent: usage.cost,
            tokens: usage.tokens(),
            usage_fraction,
            usage_percent: usage_fraction * 100.0,
            reserve: self.reserve,
            projected_fraction,
            auto_paused,
            pause_reason: auto_paused.then_some(PauseReason::Capacity),
            next_mode_switch: self.policy.next_transition(now),
        }
    }
}

/// Roll the ledger over when the local date changes
fn current_day(slot: &mut Option<DailyLedger>, today: NaiveDate) -> &mut DailyLedger {
    let stale = slot.as_ref().map(|l| l.date != today).unwrap_or(true);
    if stale {
        *slot = Some(DailyLedger::empty(today));
    }
    slot.get_or_insert_with(|| DailyLedger::empty(today))
}

pub fn ledger_path(dir: &Path) -> PathBuf {
    dir.join("service").join("capacity.json")
}

fn load_ledger(path: &Path) -> Result<Option<DailyLedger>, CapacityError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .map_err(|e| CapacityError::State(format!("failed to read {}: {}", path.display(), e)))?;
    let ledger = serde_json::from_str(&content)
        .map_err(|e| CapacityError::State(format!("failed to parse {}: {}", path.display(), e)))?;
    Ok(Some(ledger))
}

fn save_ledger(path: &Path, ledger: &DailyLedger) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(ledger).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn no_reserve() -> CapacityConfig {
        CapacityConfig {
            stage_reserve: 0.0,
            ..CapacityConfig::default()
        }
    }

    fn cost(cost: f64) -> Usage {
        Usage {
            input_tokens: 100,
            output_tokens: 50,
            cost,
        }
    }

    #[test]
    fn test_threshold_boundary() {
        let model = CapacityModel::new(&no_reserve());
        // 7.99 of 10 at 14:00 (day, 0.80) admits
        let snap = model.record_usage(at(14, 14), &cost(7.99));
        assert!(snap.admits());
        assert!(!snap.auto_paused);
        let snap = model.record_usage(at(14, 14), &cost(0.5));
        assert!(!snap.admits());
        assert!(snap.auto_paused);
    }

    #[test]
    fn test_exact_threshold_blocks_and_one_ulp_below_admits() {
        let config = CapacityConfig {
            daily_budget: 1.0,
            ..no_reserve()
        };
        let model = CapacityModel::new(&config);
        let snap = model.record_usage(at(14, 14), &cost(0.80));
        assert_eq!(snap.usage_fraction, 0.80);
        assert!(!snap.admits());
        assert_eq!(snap.pause_reason, Some(PauseReason::Capacity));

        let model = CapacityModel::new(&config);
        let below = f64::from_bits(0.80f64.to_bits() - 1);
        let snap = model.record_usage(at(14, 14), &cost(below));
        assert!(snap.admits());
    }

    #[test]
    fn test_reserve_holds_back_the_next_stage() {
        // $7.50 of $10 plus the $0.50 reserve reaches the 0.80 day threshold
        let model = CapacityModel::new(&CapacityConfig::default());
        let day = model.record_usage(at(14, 14), &cost(7.5));
        assert_eq!(day.usage_fraction, 0.75);
        assert_eq!(day.projected_fraction, 0.80);
        assert!(!day.admits());
        let night = model.snapshot(at(14, 22));
        assert!(night.admits());
    }

    #[test]
    fn test_night_has_more_room() {
        let model = CapacityModel::new(&CapacityConfig::default());
        let day = model.record_usage(at(14, 14), &cost(8.5));
        assert!(!day.admits());
        let night = model.snapshot(at(14, 23));
        assert_eq!(night.mode, Mode::Night);
        assert!(night.admits());
    }

    #[test]
    fn test_ledger_resets_at_midnight() {
        let model = CapacityModel::new(&CapacityConfig::default());
        model.record_usage(at(14, 23), &cost(9.0));
        let next_day = model.snapshot(at(15, 0));
        assert_eq!(next_day.spent, 0.0);
        assert!(next_day.admits());
    }

    #[test]
    fn test_negative_cost_is_ignored() {
        let model = CapacityModel::new(&CapacityConfig::default());
        model.record_usage(at(14, 10), &cost(2.0));
        let snap = model.record_usage(at(14, 10), &cost(-5.0));
        assert!((snap.spent - 2.0).abs() < 1e-9);
        assert_eq!(snap.tokens, 300);
    }

    #[test]
    fn test_overspend_is_clamped() {
        let model = CapacityModel::new(&CapacityConfig::default());
        let snap = model.record_usage(at(14, 23), &cost(25.0));
        assert_eq!(snap.usage_fraction, 1.0);
        assert_eq!(snap.usage_percent, 100.0);
        assert!(!snap.admits());
    }

    #[test]
    fn test_ledger_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let config = CapacityConfig::default();
        let model = CapacityModel::open(temp_dir.path(), &config).unwrap();
        model.record_usage(at(14, 10), &cost(3.25));

        let reopened = CapacityModel::open(temp_dir.path(), &config).unwrap();
        assert!((reopened.snapshot(at(14, 11)).spent - 3.25).abs() < 1e-9);
        assert_eq!(reopened.snapshot(at(15, 11)).spent, 0.0);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let model = std::sync::Arc::new(CapacityModel::new(&CapacityConfig::default()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let model = std::sync::Arc::clone(&model);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        model.record_usage(at(14, 23), &cost(0.01));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!((model.snapshot(at(14, 23)).spent - 8.0).abs() < 1e-6);
    }
}
