//! Reputation Walk
//!
//! After a request finalizes, each assigned attestor's reputation moves by a
//! bounded step depending on how far their score sat from the final average.

use crate::types::MAX_SCORE;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Step sizes and bounds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Gain for a score within tolerance
    pub reward: u32,
    /// Loss for a score outside tolerance
    pub penalty: u32,
    /// Below this the attestor is deactivated
    pub floor: u32,
    /// Upper cap
    pub ceiling: u32,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            reward: 100,
            penalty: 2_500,
            floor: 3_000,
            ceiling: MAX_SCORE,
        }
    }
}

/// Outcome of one adjustment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReputationChange {
    pub previous: u32,
    pub current: u32,
    pub within_tolerance: bool,
    /// Crossed the floor on this step
    pub fell_below_floor: bool,
}

impl ReputationChange {
    pub fn delta(&self) -> i64 {
        i64::from(self.current) - i64::from(self.previous)
    }
}

/// |score - average| > tolerance
pub fn deviates(score: u32, average: Decimal, tolerance: u32) -> bool {
    (Decimal::from(score) - average).abs() > Decimal::from(tolerance)
}

/// Apply one step of the walk
pub fn adjust(
    config: &ReputationConfig,
    current: u32,
    score: u32,
    average: Decimal,
    tolerance: u32,
) -> ReputationChange {
    let within = !deviates(score, average, tolerance);
    let next = if within {
        current.saturating_add(config.reward).min(config.ceiling)
    } else {
        current.saturating_sub(config.penalty)
    };
    ReputationChange {
        previous: current,
        current: next,
        within_tolerance: within,
        fell_below_floor: current >= config.floor && next < config.floor,
    }
}
