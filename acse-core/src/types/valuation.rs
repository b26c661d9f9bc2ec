//! Valuation Types
//!
//! Window statistics are pure: the engine owns the per-asset windows and calls
//! into these helpers for admission, eviction and the tolerance check.

use super::common::AssetId;
use crate::error::{AcseError, AcseResult};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One oracle reading
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSample {
    pub asset_id: AssetId,
    pub price: Decimal,
    pub observed_at: DateTime<Utc>,
}

impl PriceSample {
    pub fn new(asset_id: AssetId, price: Decimal, observed_at: DateTime<Utc>) -> Self {
        Self {
            asset_id,
            price,
            observed_at,
        }
    }

    pub fn validate(&self) -> AcseResult<()> {
        if self.price <= Decimal::ZERO {
            return Err(AcseError::InvalidSample {
                reason: format!("non-positive price {} for {}", self.price, self.asset_id),
            });
        }
        Ok(())
    }
}

/// Why a valuation is outside tolerance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToleranceFailure {
    NoSamples,
    InsufficientSamples,
    VolatilityExceeded,
}

impl std::fmt::Display for ToleranceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSamples => write!(f, "no samples in window"),
            Self::InsufficientSamples => write!(f, "insufficient samples"),
            Self::VolatilityExceeded => write!(f, "volatility ceiling exceeded"),
        }
    }
}

/// Buffer-smoothed valuation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Valuation {
    pub asset_id: AssetId,
    /// Mean of retained samples (zero when empty)
    pub price: Decimal,
    pub sample_count: u32,
    pub within_tolerance: bool,
    /// Standard deviation over mean
    pub coefficient_of_variation: f64,
    pub failure: Option<ToleranceFailure>,
    pub window_start: DateTime<Utc>,
    pub computed_at: DateTime<Utc>,
}

impl Valuation {
    /// `Ok(())` when within tolerance, `PriceStale` otherwise
    pub fn ensure_fresh(&self) -> AcseResult<()> {
        if self.within_tolerance {
            return Ok(());
        }
        let reason = match self.failure {
            Some(ToleranceFailure::InsufficientSamples) => format!(
                "{} ({} in window)",
                ToleranceFailure::InsufficientSamples,
                self.sample_count
            ),
            Some(ToleranceFailure::VolatilityExceeded) => format!(
                "{} (cv {:.4})",
                ToleranceFailure::VolatilityExceeded,
                self.coefficient_of_variation
            ),
            Some(other) => other.to_string(),
            None => "outside tolerance".to_string(),
        };
        Err(AcseError::PriceStale {
            asset_id: self.asset_id.to_string(),
            reason,
        })
    }
}

/// Tolerance parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ToleranceParams {
    pub min_samples: u32,
    /// Coefficient-of-variation ceiling in basis points
    pub volatility_ceiling_bps: u32,
}

/// Outcome of offering a sample to a window
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    OutOfOrder,
    TooClose,
}

/// Append `sample` unless it is older than, or too close to, the last retained one.
/// Keeps at most `max_samples`, dropping the oldest.
pub fn admit_sample(
    window: &mut VecDeque<PriceSample>,
    sample: PriceSample,
    min_spacing: chrono::Duration,
    max_samples: usize,
) -> Admission {
    if let Some(last) = window.back() {
        if sample.observed_at <= last.observed_at {
            return Admission::OutOfOrder;
        }
        if sample.observed_at - last.observed_at < min_spacing {
            return Admission::TooClose;
        }
    }
    window.push_back(sample);
    while window.len() > max_samples {
        window.pop_front();
    }
    Admission::Accepted
}

/// Drop samples observed before `cutoff`; returns how many were evicted
pub fn evict_before(window: &mut VecDeque<PriceSample>, cutoff: DateTime<Utc>) -> usize {
    let mut evicted = 0;
    while window.front().is_some_and(|s| s.observed_at < cutoff) {
        window.pop_front();
        evicted += 1;
    }
    evicted
}

/// Mean and tolerance check over samples already restricted to the window
pub fn summarize(
    asset_id: &AssetId,
    samples: &[PriceSample],
    params: ToleranceParams,
    window_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Valuation {
    let count = samples.len() as u32;
    let mut valuation = Valuation {
        asset_id: asset_id.clone(),
        price: Decimal::ZERO,
        sample_count: count,
        within_tolerance: false,
        coefficient_of_variation: 0.0,
        failure: Some(ToleranceFailure::NoSamples),
        window_start,
        computed_at: now,
    };
    if samples.is_empty() {
        return valuation;
    }

    let n = Decimal::from(count);
    let sum = samples
        .iter()
        .try_fold(Decimal::ZERO, |acc, s| acc.checked_add(s.price));
    let Some(sum) = sum else {
        // overflow: no usable price
        valuation.coefficient_of_variation = f64::INFINITY;
        valuation.failure = Some(ToleranceFailure::VolatilityExceeded);
        return valuation;
    };
    let mean = sum / n;
    valuation.price = mean;

    let variance = samples
        .iter()
        .try_fold(Decimal::ZERO, |acc, s| {
            let d = s.price - mean;
            d.checked_mul(d).and_then(|sq| acc.checked_add(sq))
        })
        .map(|total| total / n);

    let ceiling = Decimal::from(params.volatility_ceiling_bps) / Decimal::from(10_000u32);
    let limit = ceiling
        .checked_mul(mean)
        .and_then(|bound| bound.checked_mul(bound));
    let volatile = match (variance, limit) {
        (Some(var), Some(limit)) => {
            valuation.coefficient_of_variation = coefficient_of_variation(var, mean);
            var > limit
        }
        // overflow: treat as unusable
        _ => {
            valuation.coefficient_of_variation = f64::INFINITY;
            true
        }
    };

    valuation.failure = if count < params.min_samples {
        Some(ToleranceFailure::InsufficientSamples)
    } else if volatile {
        Some(ToleranceFailure::VolatilityExceeded)
    } else {
        None
    };
    valuation.within_tolerance = valuation.failure.is_none();
    valuation
}

fn coefficient_of_variation(variance: Decimal, mean: Decimal) -> f64 {
    let var = variance.to_f64().unwrap_or(f64::INFINITY);
    let mean = mean.to_f64().unwrap_or(0.0);
    if mean == 0.0 {
        if var == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        var.sqrt() / mean
    }
}
