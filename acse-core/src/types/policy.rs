//! Policy Types
//!
//! Policies are versioned by replacement. A verification request snapshots the
//! policy it was opened under, so replacing a policy never alters in-flight work.

use super::common::{CategoryKey, Score, MAX_SCORE};
use crate::error::{AcseError, AcseResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default reputation tolerance, in score points
pub const DEFAULT_DEVIATION_TOLERANCE: u32 = 1_500;

/// Rules for one asset category
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Category key
    pub category: CategoryKey,
    /// Version, incremented on each replacement
    pub version: u32,
    /// Minimum average score for VERIFIED
    pub min_score: Score,
    /// Number of attestors per request
    pub required_attestors: u32,
    /// Request lifetime in days
    pub expiry_days: u32,
    /// Whether a reviewer must approve a passing request
    pub manual_review: bool,
    /// Max deviation from the final average before reputation is lost
    pub deviation_tolerance: u32,
    /// ValuationBuffer window for assets of this category
    pub buffer_period_secs: Option<u64>,
    /// When this version was set
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Build version `version` of a policy from parameters
    pub fn from_params(
        category: CategoryKey,
        params: &PolicyParams,
        version: u32,
        now: DateTime<Utc>,
    ) -> AcseResult<Self> {
        params.validate()?;
        Ok(Self {
            category,
            version,
            min_score: Score::new(params.min_score)?,
            required_attestors: params.required_attestors,
            expiry_days: params.expiry_days,
            manual_review: params.manual_review,
            deviation_tolerance: params.deviation_tolerance,
            buffer_period_secs: params.buffer_period_secs,
            updated_at: now,
        })
    }

    /// Whether this policy already encodes `params`
    pub fn matches(&self, params: &PolicyParams) -> bool {
        self.min_score.value() == params.min_score
            && self.required_attestors == params.required_attestors
            && self.expiry_days == params.expiry_days
            && self.manual_review == params.manual_review
            && self.deviation_tolerance == params.deviation_tolerance
            && self.buffer_period_secs == params.buffer_period_secs
    }

    /// Re-check structural validity (e.g. after loading from storage)
    pub fn validate(&self) -> AcseResult<()> {
        if self.required_attestors == 0 {
            return Err(AcseError::InvalidPolicy {
                reason: format!("category {} requires zero attestors", self.category),
            });
        }
        Ok(())
    }

    /// Request lifetime
    pub fn expiry(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.expiry_days))
    }
}

/// Policy parameters as supplied by governance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyParams {
    pub min_score: u32,
    pub required_attestors: u32,
    pub expiry_days: u32,
    pub manual_review: bool,
    #[serde(default = "default_tolerance")]
    pub deviation_tolerance: u32,
    #[serde(default)]
    pub buffer_period_secs: Option<u64>,
}

fn default_tolerance() -> u32 {
    DEFAULT_DEVIATION_TOLERANCE
}

impl PolicyParams {
    /// Create parameters with default tolerance, no manual review
    pub fn new(min_score: u32, required_attestors: u32, expiry_days: u32) -> Self {
        Self {
            min_score,
            required_attestors,
            expiry_days,
            manual_review: false,
            deviation_tolerance: DEFAULT_DEVIATION_TOLERANCE,
            buffer_period_secs: None,
        }
    }

    /// Require reviewer approval
    pub fn with_manual_review(mut self, manual_review: bool) -> Self {
        self.manual_review = manual_review;
        self
    }

    /// Set the reputation tolerance
    pub fn with_deviation_tolerance(mut self, tolerance: u32) -> Self {
        self.deviation_tolerance = tolerance;
        self
    }

    /// Set the valuation window for this category
    pub fn with_buffer_period_secs(mut self, secs: u64) -> Self {
        self.buffer_period_secs = Some(secs);
        self
    }

    /// Validate parameter ranges
    pub fn validate(&self) -> AcseResult<()> {
        if self.required_attestors == 0 {
            return Err(AcseError::InvalidPolicy {
                reason: "required_attestors must be at least 1".to_string(),
            });
        }
        if self.min_score > MAX_SCORE {
            return Err(AcseError::InvalidPolicy {
                reason: format!("min_score {} exceeds {}", self.min_score, MAX_SCORE),
            });
        }
        if self.expiry_days == 0 {
            return Err(AcseError::InvalidPolicy {
                reason: "expiry_days must be at least 1".to_string(),
            });
        }
        if self.deviation_tolerance > MAX_SCORE {
            return Err(AcseError::InvalidPolicy {
                reason: format!(
                    "deviation_tolerance {} exceeds {}",
                    self.deviation_tolerance, MAX_SCORE
                ),
            });
        }
        if self.buffer_period_secs == Some(0) {
            return Err(AcseError::InvalidPolicy {
                reason: "buffer_period_secs must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_attestors_invalid() {
        let err = PolicyParams::new(7000, 0, 30).validate().unwrap_err();
        assert!(matches!(err, AcseError::InvalidPolicy { .. }));
    }

    #[test]
    fn test_min_score_range() {
        assert!(PolicyParams::new(10_000, 1, 30).validate().is_ok());
        assert!(PolicyParams::new(10_001, 1, 30).validate().is_err());
    }

    #[test]
    fn test_from_params_and_matches() {
        let params = PolicyParams::new(7000, 2, 30).with_manual_review(true);
        let policy =
            Policy::from_params(CategoryKey::new("AGRICULTURAL"), &params, 1, Utc::now()).unwrap();
        assert_eq!(policy.version, 1);
        assert_eq!(policy.min_score.value(), 7000);
        assert!(policy.matches(&params));
        assert!(!policy.matches(&params.clone().with_manual_review(false)));
        assert_eq!(policy.expiry(), chrono::Duration::days(30));
    }
}
