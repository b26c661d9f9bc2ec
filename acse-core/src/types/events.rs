//! Domain Events
//!
//! Plain facts emitted after a commit. Delivery is someone else's concern.

use super::attestor::DeactivationReason;
use super::common::{AssetId, AttestorId, CategoryKey, PartyId, RequestId, Score, SettlementId};
use super::settlement::DisputeResolution;
use super::verification::VerificationStatus;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    AttestorRegistered {
        attestor_id: AttestorId,
        identity: String,
        stake: Decimal,
        at: DateTime<Utc>,
    },
    AttestorSlashed {
        attestor_id: AttestorId,
        violation_ref: String,
        reason: String,
        applied: Decimal,
        new_stake: Decimal,
        at: DateTime<Utc>,
    },
    AttestorDeactivated {
        attestor_id: AttestorId,
        reason: DeactivationReason,
        at: DateTime<Utc>,
    },
    ReputationAdjusted {
        attestor_id: AttestorId,
        request_id: RequestId,
        previous: u32,
        current: u32,
        at: DateTime<Utc>,
    },
    PolicyUpdated {
        category: CategoryKey,
        version: u32,
        at: DateTime<Utc>,
    },
    VerificationSubmitted {
        request_id: RequestId,
        asset_id: AssetId,
        assigned: Vec<AttestorId>,
        deadline: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    AttestationRecorded {
        request_id: RequestId,
        attestor_id: AttestorId,
        score: Score,
        sequence: u32,
        at: DateTime<Utc>,
    },
    VerificationAwaitingReview {
        request_id: RequestId,
        average_score: Decimal,
        at: DateTime<Utc>,
    },
    VerificationFinalized {
        request_id: RequestId,
        asset_id: AssetId,
        status: VerificationStatus,
        average_score: Decimal,
        attestation_count: u32,
        /// Score spread exceeded the disagreement margin
        disagreement: bool,
        at: DateTime<Utc>,
    },
    SettlementCreated {
        settlement_id: SettlementId,
        asset_id: AssetId,
        buyer: PartyId,
        seller: PartyId,
        amount: Decimal,
        at: DateTime<Utc>,
    },
    SettlementFunded {
        settlement_id: SettlementId,
        at: DateTime<Utc>,
    },
    SettlementConfirmed {
        settlement_id: SettlementId,
        released_to_seller: Decimal,
        fee: Decimal,
        at: DateTime<Utc>,
    },
    SettlementRefunded {
        settlement_id: SettlementId,
        amount: Decimal,
        at: DateTime<Utc>,
    },
    SettlementDisputed {
        settlement_id: SettlementId,
        raised_by: PartyId,
        at: DateTime<Utc>,
    },
    SettlementDisputeResolved {
        settlement_id: SettlementId,
        resolution: DisputeResolution,
        at: DateTime<Utc>,
    },
    SettlementExpired {
        settlement_id: SettlementId,
        refunded: bool,
        at: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Event name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::AttestorRegistered { .. } => "attestor_registered",
            Self::AttestorSlashed { .. } => "attestor_slashed",
            Self::AttestorDeactivated { .. } => "attestor_deactivated",
            Self::ReputationAdjusted { .. } => "reputation_adjusted",
            Self::PolicyUpdated { .. } => "policy_updated",
            Self::VerificationSubmitted { .. } => "verification_submitted",
            Self::AttestationRecorded { .. } => "attestation_recorded",
            Self::VerificationAwaitingReview { .. } => "verification_awaiting_review",
            Self::VerificationFinalized { .. } => "verification_finalized",
            Self::SettlementCreated { .. } => "settlement_created",
            Self::SettlementFunded { .. } => "settlement_funded",
            Self::SettlementConfirmed { .. } => "settlement_confirmed",
            Self::SettlementRefunded { .. } => "settlement_refunded",
            Self::SettlementDisputed { .. } => "settlement_disputed",
            Self::SettlementDisputeResolved { .. } => "settlement_dispute_resolved",
            Self::SettlementExpired { .. } => "settlement_expired",
        }
    }
}
