//! Attestor Types

use super::common::{AttestorId, MAX_SCORE};
use crate::error::{AcseError, AcseResult};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A staked verifying party
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attestor {
    /// Attestor ID
    pub attestor_id: AttestorId,
    /// External identity (unique)
    pub identity: String,
    /// Organization name
    pub organization: String,
    /// Jurisdiction code
    pub jurisdiction: String,
    /// Remaining stake
    pub stake: Decimal,
    /// Reputation, 0..=10000
    pub reputation: u32,
    /// Eligible for new assignments
    pub active: bool,
    /// Why the attestor was deactivated
    pub deactivation: Option<DeactivationReason>,
    /// Open assignments (selection tie-break)
    pub active_assignments: u32,
    /// Violation refs already slashed
    pub slashed_violations: Vec<String>,
    /// Registration time
    pub registered_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl Attestor {
    /// Create a newly registered, active attestor
    pub fn new(
        identity: impl Into<String>,
        organization: impl Into<String>,
        jurisdiction: impl Into<String>,
        stake: Decimal,
        reputation: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            attestor_id: AttestorId::generate(),
            identity: identity.into(),
            organization: organization.into(),
            jurisdiction: jurisdiction.into(),
            stake,
            reputation: reputation.min(MAX_SCORE),
            active: true,
            deactivation: None,
            active_assignments: 0,
            slashed_violations: Vec::new(),
            registered_at: now,
            updated_at: now,
        }
    }

    /// Whether the attestor may be assigned to new requests
    pub fn is_assignable(&self) -> bool {
        self.active
    }

    /// Apply a slash. Clamps at zero; each violation ref is applied at most once.
    pub fn apply_slash(
        &mut self,
        amount: Decimal,
        violation_ref: &str,
        now: DateTime<Utc>,
    ) -> AcseResult<SlashOutcome> {
        if amount <= Decimal::ZERO {
            return Err(AcseError::InvalidAmount {
                reason: "Slash amount must be positive".to_string(),
            });
        }
        if self.slashed_violations.iter().any(|v| v == violation_ref) {
            return Err(AcseError::ViolationAlreadySlashed {
                attestor_id: self.attestor_id.to_string(),
                violation_ref: violation_ref.to_string(),
            });
        }

        let applied = amount.min(self.stake);
        self.stake -= applied;
        self.slashed_violations.push(violation_ref.to_string());
        self.updated_at = now;

        Ok(SlashOutcome {
            requested: amount,
            applied,
            new_stake: self.stake,
        })
    }

    /// Deactivate with reason. Stake is untouched.
    pub fn deactivate(&mut self, reason: DeactivationReason, now: DateTime<Utc>) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.deactivation = Some(reason);
        self.updated_at = now;
        true
    }

    /// Reactivate after a low-stake deactivation was cured.
    pub fn reactivate(&mut self, now: DateTime<Utc>) {
        self.active = true;
        self.deactivation = None;
        self.updated_at = now;
    }
}

/// Result of a slash
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlashOutcome {
    /// Amount asked for
    pub requested: Decimal,
    /// Amount actually removed (clamped to remaining stake)
    pub applied: Decimal,
    /// Stake after the slash
    pub new_stake: Decimal,
}

/// Deactivation reason
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationReason {
    /// Stake fell below the registration minimum
    StakeBelowMinimum,
    /// Reputation fell below the floor
    ReputationBelowFloor,
    /// Attestor exited voluntarily
    Voluntary,
}

/// Registration input
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttestorRegistration {
    pub identity: String,
    pub organization: String,
    pub jurisdiction: String,
    pub stake: Decimal,
}

impl AttestorRegistration {
    pub fn new(
        identity: impl Into<String>,
        organization: impl Into<String>,
        jurisdiction: impl Into<String>,
        stake: Decimal,
    ) -> Self {
        Self {
            identity: identity.into(),
            organization: organization.into(),
            jurisdiction: jurisdiction.into(),
            stake,
        }
    }
}
