//! Engine Configuration
//!
//! All settings have defaults; `EngineConfig::from_env` overrides them from
//! variables with the `ACSE_` prefix.

use acse_core::{AcseError, AcseResult, ReputationConfig};
use acse_store::{StorageBackend, StorageConfig};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Attestor registry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestorConfig {
    /// Global minimum stake for registration and continued activity
    pub min_stake: Decimal,
    /// Reputation assigned on registration
    pub initial_reputation: u32,
    pub reputation: ReputationConfig,
}

impl Default for AttestorConfig {
    fn default() -> Self {
        Self {
            min_stake: Decimal::new(1_000, 0),
            initial_reputation: 5_000,
            reputation: ReputationConfig::default(),
        }
    }
}

/// Consensus settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Score spread logged as disagreement; never blocks finalization
    pub disagreement_margin: u32,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            disagreement_margin: 4_000,
        }
    }
}

/// ValuationBuffer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValuationConfig {
    /// Window used when the category policy sets none
    pub default_buffer_period_secs: u64,
    /// Minimum spacing between retained samples
    pub min_sample_spacing_secs: u64,
    /// Samples retained per asset
    pub max_samples: usize,
    /// Fewer samples than this is "insufficient data"
    pub min_samples: u32,
    /// Coefficient-of-variation ceiling, basis points
    pub volatility_ceiling_bps: u32,
}

impl Default for ValuationConfig {
    fn default() -> Self {
        Self {
            default_buffer_period_secs: 3_600,
            min_sample_spacing_secs: 30,
            max_samples: 64,
            min_samples: 3,
            volatility_ceiling_bps: 500,
        }
    }
}

/// SettlementEngine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Fee withheld from the seller on confirmation
    pub fee_bps: u32,
    /// Rail party holding escrowed funds
    pub escrow_account: String,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            fee_bps: 250,
            escrow_account: "acse-escrow".to_string(),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub attestor: AttestorConfig,
    pub consensus: ConsensusConfig,
    pub valuation: ValuationConfig,
    pub settlement: SettlementConfig,
    pub storage: StorageConfig,
    /// Timeout applied to every registry / oracle / rail call
    pub collaborator_timeout_ms: u64,
    pub sweep_interval_secs: u64,
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            attestor: AttestorConfig::default(),
            consensus: ConsensusConfig::default(),
            valuation: ValuationConfig::default(),
            settlement: SettlementConfig::default(),
            storage: StorageConfig::default(),
            collaborator_timeout_ms: 5_000,
            sweep_interval_secs: 60,
            event_channel_capacity: 1_024,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - ACSE_MIN_STAKE, ACSE_INITIAL_REPUTATION
    /// - ACSE_REPUTATION_REWARD, ACSE_REPUTATION_PENALTY, ACSE_REPUTATION_FLOOR
    /// - ACSE_DISAGREEMENT_MARGIN
    /// - ACSE_BUFFER_PERIOD_SECS, ACSE_MIN_SAMPLE_SPACING_SECS, ACSE_MAX_SAMPLES,
    ///   ACSE_MIN_SAMPLES, ACSE_VOLATILITY_CEILING_BPS
    /// - ACSE_FEE_BPS, ACSE_ESCROW_ACCOUNT
    /// - ACSE_STORAGE_BACKEND (memory/sled), ACSE_DATA_DIR
    /// - ACSE_COLLABORATOR_TIMEOUT_MS, ACSE_SWEEP_INTERVAL_SECS, ACSE_EVENT_CAPACITY
    ///
    /// Missing or unparsable values fall back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();

        let reputation = ReputationConfig {
            reward: env_parse("ACSE_REPUTATION_REWARD").unwrap_or(d.attestor.reputation.reward),
            penalty: env_parse("ACSE_REPUTATION_PENALTY").unwrap_or(d.attestor.reputation.penalty),
            floor: env_parse("ACSE_REPUTATION_FLOOR").unwrap_or(d.attestor.reputation.floor),
            ceiling: d.attestor.reputation.ceiling,
        };

        let backend = match env::var("ACSE_STORAGE_BACKEND")
            .map(|s| s.to_lowercase())
            .as_deref()
        {
            Ok("sled") => StorageBackend::Sled,
            _ => StorageBackend::Memory,
        };

        Self {
            attestor: AttestorConfig {
                min_stake: env_parse("ACSE_MIN_STAKE").unwrap_or(d.attestor.min_stake),
                initial_reputation: env_parse("ACSE_INITIAL_REPUTATION")
                    .unwrap_or(d.attestor.initial_reputation),
                reputation,
            },
            consensus: ConsensusConfig {
                disagreement_margin: env_parse("ACSE_DISAGREEMENT_MARGIN")
                    .unwrap_or(d.consensus.disagreement_margin),
            },
            valuation: ValuationConfig {
                default_buffer_period_secs: env_parse("ACSE_BUFFER_PERIOD_SECS")
                    .unwrap_or(d.valuation.default_buffer_period_secs),
                min_sample_spacing_secs: env_parse("ACSE_MIN_SAMPLE_SPACING_SECS")
                    .unwrap_or(d.valuation.min_sample_spacing_secs),
                max_samples: env_parse("ACSE_MAX_SAMPLES").unwrap_or(d.valuation.max_samples),
                min_samples: env_parse("ACSE_MIN_SAMPLES").unwrap_or(d.valuation.min_samples),
                volatility_ceiling_bps: env_parse("ACSE_VOLATILITY_CEILING_BPS")
                    .unwrap_or(d.valuation.volatility_ceiling_bps),
            },
            settlement: SettlementConfig {
                fee_bps: env_parse("ACSE_FEE_BPS").unwrap_or(d.settlement.fee_bps),
                escrow_account: env::var("ACSE_ESCROW_ACCOUNT")
                    .unwrap_or(d.settlement.escrow_account),
            },
            storage: StorageConfig {
                backend,
                data_dir: env::var("ACSE_DATA_DIR").unwrap_or(d.storage.data_dir),
                cache_capacity: d.storage.cache_capacity,
            },
            collaborator_timeout_ms: env_parse("ACSE_COLLABORATOR_TIMEOUT_MS")
                .unwrap_or(d.collaborator_timeout_ms),
            sweep_interval_secs: env_parse("ACSE_SWEEP_INTERVAL_SECS")
                .unwrap_or(d.sweep_interval_secs),
            event_channel_capacity: env_parse("ACSE_EVENT_CAPACITY")
                .unwrap_or(d.event_channel_capacity),
        }
    }

    /// Reject nonsensical settings
    pub fn validate(&self) -> AcseResult<()> {
        let invalid = |reason: &str| {
            Err(AcseError::InvalidPolicy {
                reason: format!("engine config: {}", reason),
            })
        };
        if self.settlement.fee_bps >= 10_000 {
            return invalid("fee_bps must be below 10000");
        }
        if self.valuation.min_samples == 0 {
            return invalid("min_samples must be at least 1");
        }
        if self.valuation.max_samples < self.valuation.min_samples as usize {
            return invalid("max_samples must be >= min_samples");
        }
        if self.valuation.default_buffer_period_secs == 0 {
            return invalid("default_buffer_period_secs must be positive");
        }
        if self.sweep_interval_secs == 0 {
            return invalid("sweep_interval_secs must be positive");
        }
        if self.collaborator_timeout_ms == 0 {
            return invalid("collaborator_timeout_ms must be positive");
        }
        if self.event_channel_capacity == 0 {
            return invalid("event_channel_capacity must be positive");
        }
        if self.attestor.min_stake < Decimal::ZERO {
            return invalid("min_stake must not be negative");
        }
        let rep = &self.attestor.reputation;
        if rep.floor > rep.ceiling || self.attestor.initial_reputation > rep.ceiling {
            return invalid("reputation floor and initial value must not exceed the ceiling");
        }
        Ok(())
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
