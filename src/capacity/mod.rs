//! Capacity-aware admission.
//!
//! - [`window`]: maps wall-clock hours to day/night/off-hours modes
//! - [`ledger`]: daily usage ledger and capacity snapshots
//! - [`admission`]: decides which tasks may run this poll cycle

pub mod admission;
pub mod ledger;
pub mod window;

use thiserror::Error;

pub use admission::{
    Admission, AdmissionController, Clock, CyclePlan, PauseDecision, StartDecision, system_clock,
};
pub use ledger::{CapacityModel, CapacitySnapshot, DailyLedger};
pub use window::{Mode, ModeInfo, Thresholds, TimeWindowPolicy, OFF_HOURS_THRESHOLD, mode_at};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapacityError {
    #[error("day and night hours overlap: {0:?}")]
    OverlappingHours(Vec<u32>),
    #[error("hour {0} is outside 0-23")]
    HourOutOfRange(u32),
    #[error("{name} must be within [0, 1], got {value}")]
    ThresholdOutOfRange { name: String, value: f64 },
    #[error("daily budget must be positive, got {0}")]
    NonPositiveBudget(f64),
    #[error("stage reserve must not be negative, got {0}")]
    NegativeReserve(f64),
    #[error("capacity state error: {0}")]
    State(String),
}
