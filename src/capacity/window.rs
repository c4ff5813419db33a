//! Time window policy
//!
//! Every hour of the local day belongs to exactly one mode. Configured day
//! hours win over night hours when both claim the same hour; anything left
//! over is off-hours. With time-based usage disabled every hour is
//! off-hours.

use chrono::{Duration, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::CapacityConfig;

/// Built-in off-hours threshold; the effective value never exceeds the
/// configured day or night threshold.
pub const OFF_HOURS_THRESHOLD: f64 = 0.50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Day,
    Night,
    OffHours,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Day => "day",
            Mode::Night => "night",
            Mode::OffHours => "off-hours",
        };
        f.write_str(s)
    }
}

/// Per-mode capacity thresholds, as fractions of the daily budget
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub day: f64,
    pub night: f64,
    pub off_hours: f64,
}

impl Thresholds {
    pub fn for_mode(&self, mode: Mode) -> f64 {
        match mode {
            Mode::Day => self.day,
            Mode::Night => self.night,
            Mode::OffHours => self.off_hours,
        }
    }
}

/// Result of a mode lookup
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModeInfo {
    pub mode: Mode,
    pub threshold: f64,
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone)]
pub struct TimeWindowPolicy {
    hours: [Mode; 24],
    thresholds: Thresholds,
}

impl TimeWindowPolicy {
    pub fn new(config: &CapacityConfig) -> Self {
        let mut hours = [Mode::OffHours; 24];
        if config.time_based {
            // Night first so day overwrites it on overlap
            for &hour in &config.night_hours {
                if let Some(slot) = hours.get_mut(hour as usize) {
                    *slot = Mode::Night;
                }
            }
            for &hour in &config.day_hours {
                if let Some(slot) = hours.get_mut(hour as usize) {
                    *slot = Mode::Day;
                }
            }
        }

        let off_hours = OFF_HOURS_THRESHOLD
            .min(config.day_threshold)
            .min(config.night_threshold);

        Self {
            hours,
            thresholds: Thresholds {
                day: config.day_threshold,
                night: config.night_threshold,
                off_hours,
            },
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn mode_for_hour(&self, hour: u32) -> Mode {
        self.hours[(hour % 24) as usize]
    }

    pub fn mode_at(&self, at: NaiveDateTime) -> ModeInfo {
        let mode = self.mode_for_hour(at.hour());
        ModeInfo {
            mode,
            threshold: self.thresholds.for_mode(mode),
            thresholds: self.thresholds,
        }
    }

    /// Start of the next hour whose mode differs from the mode at `at`.
    /// `None` when the whole day is one mode.
    pub fn next_transition(&self, at: NaiveDateTime) -> Option<NaiveDateTime> {
        let current = self.mode_for_hour(at.hour());
        let hour_start = at.date().and_hms_opt(at.hour(), 0, 0)?;
        (1..=24)
            .map(|offset| hour_start + Duration::hours(offset))
            .find(|candidate| self.mode_for_hour(candidate.hour()) != current)
    }
}

/// Mode lookup straight from configuration
pub fn mode_at(at: NaiveDateTime, config: &CapacityConfig) -> ModeInfo {
    TimeWindowPolicy::new(config).mode_at(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn test_default_windows() {
        let config = CapacityConfig::default();
        assert_eq!(mode_at(at(14, 0), &config).mode, Mode::Day);
        assert_eq!(mode_at(at(22, 0), &config).mode, Mode::Night);
        assert_eq!(mode_at(at(3, 30), &config).mode, Mode::Night);
        assert_eq!(mode_at(at(19, 0), &config).mode, Mode::OffHours);
        assert_eq!(mode_at(at(14, 0), &config).threshold, 0.80);
        assert_eq!(mode_at(at(22, 0), &config).threshold, 0.95);
    }

    #[test]
    fn test_modes_partition_the_day() {
        let config = CapacityConfig {
            day_hours: vec![8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18],
            night_hours: vec![20, 21, 22, 23, 0, 1, 2, 3, 4],
            ..CapacityConfig::default()
        };
        let policy = TimeWindowPolicy::new(&config);
        for hour in 0..24 {
            let mode = policy.mode_for_hour(hour);
            let in_day = config.day_hours.contains(&hour);
            let in_night = config.night_hours.contains(&hour);
            let expected = match (in_day, in_night) {
                (true, false) => Mode::Day,
                (false, true) => Mode::Night,
                (false, false) => Mode::OffHours,
                (true, true) => unreachable!("no overlap configured"),
            };
            assert_eq!(mode, expected, "hour {}", hour);
        }
    }

    #[test]
    fn test_day_wins_on_overlap() {
        let config = CapacityConfig {
            day_hours: vec![6, 7, 8],
            night_hours: vec![4, 5, 6],
            ..CapacityConfig::default()
        };
        let policy = TimeWindowPolicy::new(&config);
        assert_eq!(policy.mode_for_hour(6), Mode::Day);
        assert_eq!(policy.mode_for_hour(5), Mode::Night);
    }

    #[test]
    fn test_disabled_means_off_hours_everywhere() {
        let config = CapacityConfig {
            time_based: false,
            ..CapacityConfig::default()
        };
        let policy = TimeWindowPolicy::new(&config);
        for hour in 0..24 {
            assert_eq!(policy.mode_for_hour(hour), Mode::OffHours);
        }
        assert_eq!(policy.next_transition(at(10, 0)), None);
    }

    #[test]
    fn test_off_hours_threshold_is_conservative() {
        let config = CapacityConfig::default();
        let thresholds = TimeWindowPolicy::new(&config).thresholds();
        assert_eq!(thresholds.off_hours, OFF_HOURS_THRESHOLD);

        let config = CapacityConfig {
            day_threshold: 0.3,
            ..CapacityConfig::default()
        };
        let thresholds = TimeWindowPolicy::new(&config).thresholds();
        assert_eq!(thresholds.off_hours, 0.3);
        assert!(thresholds.off_hours <= thresholds.day);
        assert!(thresholds.off_hours <= thresholds.night);
    }

    #[test]
    fn test_next_transition() {
        let policy = TimeWindowPolicy::new(&CapacityConfig::default());
        // 14:25 day -> 18:00 off-hours
        assert_eq!(policy.next_transition(at(14, 25)), Some(at(18, 0)));
        // 23:10 night -> 06:00 next day off-hours
        let next = policy.next_transition(at(23, 10)).unwrap();
        assert_eq!(next.hour(), 6);
        assert_eq!(next.date(), NaiveDate::from_ymd_opt(2026, 3, 15).unwrap());
    }
}
