//! Valuation Buffer
//!
//! One rolling window of oracle samples per asset. Windows are shared as
//! `Arc<VecDeque<_>>` and copied on write, so a reader summarising a window
//! never holds the map shard while it computes. Expired samples are evicted on
//! read; ingestion only appends.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use acse_core::{
    admit_sample, evict_before, summarize, AcseError, AcseResult, Admission, AssetId, Clock,
    PriceSample, ToleranceParams, Valuation,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::collaborators::{guarded, OracleClient, ORACLE};
use crate::config::ValuationConfig;

pub struct ValuationBuffer {
    windows: DashMap<AssetId, Arc<VecDeque<PriceSample>>>,
    config: ValuationConfig,
    oracle: Option<Arc<dyn OracleClient>>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl ValuationBuffer {
    pub fn new(
        config: ValuationConfig,
        oracle: Option<Arc<dyn OracleClient>>,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            windows: DashMap::new(),
            config,
            oracle,
            timeout,
            clock,
        }
    }

    fn params(&self) -> ToleranceParams {
        ToleranceParams {
            min_samples: self.config.min_samples,
            volatility_ceiling_bps: self.config.volatility_ceiling_bps,
        }
    }

    fn period(&self, period_secs: Option<u64>) -> chrono::Duration {
        let secs = period_secs.unwrap_or(self.config.default_buffer_period_secs);
        chrono::Duration::seconds(secs.min(u64::from(u32::MAX)) as i64)
    }

    /// Offer one sample to its asset's window
    pub fn ingest(&self, sample: PriceSample) -> AcseResult<Admission> {
        sample.validate()?;
        let asset_id = sample.asset_id.clone();
        let spacing = chrono::Duration::seconds(self.config.min_sample_spacing_secs as i64);

        let mut window = self.windows.entry(asset_id.clone()).or_default();
        let admission = admit_sample(
            Arc::make_mut(window.value_mut()),
            sample,
            spacing,
            self.config.max_samples,
        );
        if admission != Admission::Accepted {
            debug!(asset_id = %asset_id, admission = ?admission, "Price sample dropped");
        }
        Ok(admission)
    }

    /// Pull new samples from the oracle. Never called under an entity lock.
    pub async fn refresh(&self, asset_id: &AssetId, period_secs: Option<u64>) -> AcseResult<usize> {
        let oracle = self.oracle.as_ref().ok_or_else(|| AcseError::CollaboratorFailed {
            collaborator: ORACLE.to_string(),
            reason: "no valuation oracle configured".to_string(),
        })?;

        let since = self
            .last_observed(asset_id)
            .unwrap_or_else(|| self.clock.now() - self.period(period_secs));
        let samples = guarded(ORACLE, self.timeout, oracle.latest_samples(asset_id, since)).await?;

        let mut accepted = 0;
        for sample in samples {
            if &sample.asset_id != asset_id {
                debug!(asset_id = %asset_id, other = %sample.asset_id, "Oracle sample for another asset ignored");
                continue;
            }
            match self.ingest(sample) {
                Ok(Admission::Accepted) => accepted += 1,
                Ok(_) => {}
                Err(e) => debug!(asset_id = %asset_id, error = %e, "Oracle sample rejected"),
            }
        }
        debug!(asset_id = %asset_id, count = accepted, "Valuation refreshed");
        Ok(accepted)
    }

    /// `refresh` when an oracle is wired in, otherwise a no-op
    pub async fn refresh_if_configured(
        &self,
        asset_id: &AssetId,
        period_secs: Option<u64>,
    ) -> AcseResult<usize> {
        if self.oracle.is_none() {
            return Ok(0);
        }
        self.refresh(asset_id, period_secs).await
    }

    /// Buffer-smoothed valuation over the trailing window
    pub fn current_valuation(&self, asset_id: &AssetId, period_secs: Option<u64>) -> Valuation {
        let now = self.clock.now();
        let window_start = now - self.period(period_secs);

        let snapshot = match self.windows.get_mut(asset_id) {
            Some(mut window) => {
                let stale = window
                    .front()
                    .is_some_and(|s| s.observed_at < window_start);
                if stale {
                    let evicted = evict_before(Arc::make_mut(window.value_mut()), window_start);
                    debug!(asset_id = %asset_id, count = evicted, "Samples evicted");
                }
                window.value().clone()
            }
            None => Arc::new(VecDeque::new()),
        };

        let samples: Vec<PriceSample> = snapshot.iter().cloned().collect();
        summarize(asset_id, &samples, self.params(), window_start, now)
    }

    /// Valuation, or `PriceStale` when outside tolerance
    pub fn check_fresh(&self, asset_id: &AssetId, period_secs: Option<u64>) -> AcseResult<Valuation> {
        let valuation = self.current_valuation(asset_id, period_secs);
        if let Err(e) = valuation.ensure_fresh() {
            warn!(
                asset_id = %asset_id,
                count = valuation.sample_count,
                cv = valuation.coefficient_of_variation,
                "Valuation outside tolerance"
            );
            return Err(e);
        }
        Ok(valuation)
    }

    fn last_observed(&self, asset_id: &AssetId) -> Option<DateTime<Utc>> {
        self.windows
            .get(asset_id)
            .and_then(|w| w.back().map(|s| s.observed_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{CollaboratorError, MockOracleClient};
    use acse_core::{ErrorKind, ManualClock, ToleranceFailure};
    use rust_decimal::Decimal;

    fn asset() -> AssetId {
        AssetId::new("asset:farm-1")
    }

    fn buffer(clock: Arc<ManualClock>, oracle: Option<Arc<dyn OracleClient>>) -> ValuationBuffer {
        ValuationBuffer::new(
            ValuationConfig::default(),
            oracle,
            Duration::from_millis(200),
            clock,
        )
    }

    fn feed(buffer: &ValuationBuffer, clock: &ManualClock, prices: &[i64]) {
        for p in prices {
            clock.advance(chrono::Duration::seconds(60));
            buffer
                .ingest(PriceSample::new(asset(), Decimal::new(*p, 0), clock.now()))
                .unwrap();
        }
    }

    #[test]
    fn test_fresh_window() {
        let clock = Arc::new(ManualClock::default());
        let buffer = buffer(clock.clone(), None);
        feed(&buffer, &clock, &[10_000, 10_050, 9_950, 10_020, 9_980]);

        let valuation = buffer.check_fresh(&asset(), None).unwrap();
        assert_eq!(valuation.sample_count, 5);
        assert_eq!(valuation.price, Decimal::new(10_000, 0));
    }

    #[test]
    fn test_single_sample_is_stale() {
        let clock = Arc::new(ManualClock::default());
        let buffer = buffer(clock.clone(), None);
        feed(&buffer, &clock, &[10_000]);

        let err = buffer.check_fresh(&asset(), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PriceStale);
    }

    #[test]
    fn test_lazy_eviction_on_read() {
        let clock = Arc::new(ManualClock::default());
        let buffer = buffer(clock.clone(), None);
        feed(&buffer, &clock, &[100, 100, 100]);
        assert!(buffer.current_valuation(&asset(), None).within_tolerance);

        clock.advance(chrono::Duration::hours(2));
        let valuation = buffer.current_valuation(&asset(), None);
        assert_eq!(valuation.sample_count, 0);
        assert_eq!(valuation.failure, Some(ToleranceFailure::NoSamples));
    }

    #[test]
    fn test_ingest_spacing_and_order() {
        let clock = Arc::new(ManualClock::default());
        let buffer = buffer(clock.clone(), None);
        let t = clock.now();
        let sample = |secs: i64| PriceSample::new(asset(), Decimal::ONE, t + chrono::Duration::seconds(secs));

        assert_eq!(buffer.ingest(sample(0)).unwrap(), Admission::Accepted);
        assert_eq!(buffer.ingest(sample(10)).unwrap(), Admission::TooClose);
        assert_eq!(buffer.ingest(sample(-5)).unwrap(), Admission::OutOfOrder);
        assert_eq!(buffer.ingest(sample(45)).unwrap(), Admission::Accepted);

        let bad = PriceSample::new(asset(), Decimal::ZERO, t + chrono::Duration::seconds(90));
        assert_eq!(buffer.ingest(bad).unwrap_err().kind(), ErrorKind::InvalidSample);
    }

    #[tokio::test]
    async fn test_refresh_pulls_from_oracle() {
        let clock = Arc::new(ManualClock::default());
        let start = clock.now();
        let mut oracle = MockOracleClient::new();
        oracle.expect_latest_samples().times(1).returning(move |id, _| {
            Ok((1..=4)
                .map(|i| PriceSample::new(id.clone(), Decimal::new(500, 0), start + chrono::Duration::minutes(i)))
                .collect())
        });
        let buffer = buffer(clock.clone(), Some(Arc::new(oracle)));
        clock.advance(chrono::Duration::minutes(5));

        assert_eq!(buffer.refresh(&asset(), None).await.unwrap(), 4);
        assert!(buffer.check_fresh(&asset(), None).is_ok());
    }

    #[tokio::test]
    async fn test_refresh_failure_is_retryable() {
        let mut oracle = MockOracleClient::new();
        oracle
            .expect_latest_samples()
            .returning(|_, _| Err(CollaboratorError::Unavailable("feed down".into())));
        let buffer = buffer(Arc::new(ManualClock::default()), Some(Arc::new(oracle)));

        let err = buffer.refresh(&asset(), None).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_refresh_without_oracle() {
        let buffer = buffer(Arc::new(ManualClock::default()), None);
        assert_eq!(buffer.refresh_if_configured(&asset(), None).await.unwrap(), 0);
        assert!(buffer.refresh(&asset(), None).await.is_err());
    }
}
