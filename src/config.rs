//! Project configuration for nightshift
//!
//! Configuration is stored in `.nightshift/config.toml` and controls the
//! daemon loop, the capacity budget and its time windows, the watchdog and
//! workflow defaults. Every field has a default, so a missing file or a
//! partial file is fine.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::capacity::CapacityError;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub capacity: CapacityConfig,

    #[serde(default)]
    pub watchdog: WatchdogConfig,

    #[serde(default)]
    pub workflow: WorkflowConfig,
}

/// Daemon loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between poll cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Ceiling on tasks running at once; extra tasks wait for the next cycle
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Seconds between self health checks
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,

    /// Seconds between heartbeat file writes
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,

    /// Default log filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_concurrent_tasks() -> usize {
    2
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            health_check_interval: default_health_check_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

/// Daily budget and time-window configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityConfig {
    /// When false every hour is treated as off-hours
    #[serde(default = "default_true")]
    pub time_based: bool,

    /// Daily spend budget (USD); resets at local midnight
    #[serde(default = "default_daily_budget")]
    pub daily_budget: f64,

    /// Hours of the day (0-23) that count as day mode
    #[serde(default = "default_day_hours")]
    pub day_hours: Vec<u32>,

    /// Hours of the day (0-23) that count as night mode; may wrap past midnight
    #[serde(default = "default_night_hours")]
    pub night_hours: Vec<u32>,

    /// Fraction of the daily budget usable during day mode
    #[serde(default = "default_day_threshold")]
    pub day_threshold: f64,

    /// Fraction of the daily budget usable during night mode
    #[serde(default = "default_night_threshold")]
    pub night_threshold: f64,

    /// Spend (USD) set aside for the stage about to start; admission checks
    /// `(spent + stage_reserve) / daily_budget` against the threshold
    #[serde(default = "default_stage_reserve")]
    pub stage_reserve: f64,
}

fn default_true() -> bool {
    true
}

fn default_daily_budget() -> f64 {
    10.0
}

fn default_day_hours() -> Vec<u32> {
    (9..=17).collect()
}

fn default_night_hours() -> Vec<u32> {
    vec![22, 23, 0, 1, 2, 3, 4, 5]
}

fn default_day_threshold() -> f64 {
    0.80
}

fn default_night_threshold() -> f64 {
    0.95
}

fn default_stage_reserve() -> f64 {
    0.50
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            time_based: true,
            daily_budget: default_daily_budget(),
            day_hours: default_day_hours(),
            night_hours: default_night_hours(),
            day_threshold: default_day_threshold(),
            night_threshold: default_night_threshold(),
            stage_reserve: default_stage_reserve(),
        }
    }
}

impl CapacityConfig {
    /// Reject configurations the scheduler must not start with
    pub fn validate(&self) -> Result<(), CapacityError> {
        if !(self.daily_budget > 0.0) {
            return Err(CapacityError::NonPositiveBudget(self.daily_budget));
        }
        if !(self.stage_reserve >= 0.0) {
            return Err(CapacityError::NegativeReserve(self.stage_reserve));
        }
        for (name, value) in [
            ("day_threshold", self.day_threshold),
            ("night_threshold", self.night_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CapacityError::ThresholdOutOfRange {
                    name: name.to_string(),
                    value,
                });
            }
        }
        for hour in self.day_hours.iter().chain(self.night_hours.iter()) {
            if *hour > 23 {
                return Err(CapacityError::HourOutOfRange(*hour));
            }
        }
        let mut overlap: Vec<u32> = self
            .day_hours
            .iter()
            .filter(|h| self.night_hours.contains(h))
            .copied()
            .collect();
        if !overlap.is_empty() {
            overlap.sort_unstable();
            overlap.dedup();
            return Err(CapacityError::OverlappingHours(overlap));
        }
        Ok(())
    }
}

/// Watchdog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Start the daemon under a watchdog by default
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds without a heartbeat before the daemon is considered hung
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: u64,

    /// Seconds between liveness checks
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    /// First restart delay in seconds; doubles on each consecutive restart
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: u64,

    /// Upper bound on the restart delay in seconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff: u64,

    /// Uptime in seconds after which the backoff resets
    #[serde(default = "default_stable_after")]
    pub stable_after: u64,
}

fn default_heartbeat_timeout() -> u64 {
    30
}

fn default_check_interval() -> u64 {
    5
}

fn default_initial_backoff() -> u64 {
    1
}

fn default_max_backoff() -> u64 {
    60
}

fn default_stable_after() -> u64 {
    300
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_timeout: default_heartbeat_timeout(),
            check_interval: default_check_interval(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            stable_after: default_stable_after(),
        }
    }
}

/// Workflow defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Workflow used by `add` when none is given
    #[serde(default = "default_workflow")]
    pub default_workflow: String,

    /// Stage timeout in seconds when a stage does not set one
    #[serde(default = "default_stage_timeout")]
    pub default_timeout: u64,
}

fn default_workflow() -> String {
    "default".to_string()
}

fn default_stage_timeout() -> u64 {
    600
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_workflow: default_workflow(),
            default_timeout: default_stage_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from `<dir>/config.toml`.
    /// Returns default config if the file doesn't exist.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let config_path = dir.join("config.toml");

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config: {}", e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        Ok(config)
    }

    /// Save configuration to `<dir>/config.toml`
    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        let config_path = dir.join("config.toml");

        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize config: {}", e))?;

        fs::write(&config_path, content)
            .map_err(|e| anyhow::anyhow!("Failed to write config: {}", e))?;

        Ok(())
    }

    /// Initialize default config file if it doesn't exist
    pub fn init(dir: &Path) -> anyhow::Result<bool> {
        let config_path = dir.join("config.toml");

        if config_path.exists() {
            return Ok(false);
        }

        Self::default().save(dir)?;
        Ok(true)
    }

    /// Check the parts of the configuration that are fatal when wrong
    pub fn validate(&self) -> anyhow::Result<()> {
        self.capacity.validate()?;
        if self.daemon.max_concurrent_tasks == 0 {
            anyhow::bail!("daemon.max_concurrent_tasks must be at least 1");
        }
        if self.daemon.poll_interval == 0 {
            anyhow::bail!("daemon.poll_interval must be at least 1 second");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.daemon.poll_interval, 5);
        assert_eq!(config.capacity.day_threshold, 0.80);
        assert_eq!(config.capacity.night_threshold, 0.95);
        assert!(config.watchdog.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_missing_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path()).unwrap();
        assert_eq!(config.workflow.default_workflow, "default");
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();

        let mut config = Config::default();
        config.daemon.max_concurrent_tasks = 7;
        config.capacity.daily_budget = 25.0;
        config.save(temp_dir.path()).unwrap();

        let loaded = Config::load(temp_dir.path()).unwrap();
        assert_eq!(loaded.daemon.max_concurrent_tasks, 7);
        assert_eq!(loaded.capacity.daily_budget, 25.0);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("config.toml"),
            "[capacity]\ndaily_budget = 3.5\n",
        )
        .unwrap();

        let config = Config::load(temp_dir.path()).unwrap();
        assert_eq!(config.capacity.daily_budget, 3.5);
        assert_eq!(config.capacity.day_hours, (9..=17).collect::<Vec<_>>());
        assert_eq!(config.daemon.max_concurrent_tasks, 2);
    }

    #[test]
    fn test_init_does_not_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        assert!(Config::init(temp_dir.path()).unwrap());
        assert!(!Config::init(temp_dir.path()).unwrap());
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let mut capacity = CapacityConfig::default();
        capacity.night_hours.push(9);
        capacity.night_hours.push(10);
        assert_eq!(
            capacity.validate(),
            Err(CapacityError::OverlappingHours(vec![9, 10]))
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut capacity = CapacityConfig::default();
        capacity.day_hours.push(24);
        assert_eq!(capacity.validate(), Err(CapacityError::HourOutOfRange(24)));

        let mut capacity = CapacityConfig::default();
        capacity.night_threshold = 1.5;
        assert!(matches!(
            capacity.validate(),
            Err(CapacityError::ThresholdOutOfRange { .. })
        ));

        let mut capacity = CapacityConfig::default();
        capacity.daily_budget = 0.0;
        assert!(matches!(
            capacity.validate(),
            Err(CapacityError::NonPositiveBudget(_))
        ));
    }
}
