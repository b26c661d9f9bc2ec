//! Settlement Types
//!
//! Core invariants:
//! - Created only against a VERIFIED asset (checked by the engine)
//! - Terminal statuses: CONFIRMED, REFUNDED, EXPIRED
//! - Escrow is released once: seller + fee == amount, or buyer == amount
//! - While a transfer is in flight no other transition may start

use super::common::{AssetId, PartyId, RequestId, SettlementId};
use crate::error::{AcseError, AcseResult};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Settlement status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Created,
    Funded,
    Confirmed,
    Refunded,
    Disputed,
    Expired,
}

impl SettlementStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Refunded | Self::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Funded => "FUNDED",
            Self::Confirmed => "CONFIRMED",
            Self::Refunded => "REFUNDED",
            Self::Disputed => "DISPUTED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Funds movement kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    /// Buyer -> escrow
    Hold,
    /// Escrow -> seller
    Release,
    /// Escrow -> buyer
    Refund,
}

impl std::fmt::Display for TransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hold => write!(f, "hold"),
            Self::Release => write!(f, "release"),
            Self::Refund => write!(f, "refund"),
        }
    }
}

/// Arbiter decision
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeResolution {
    ReleaseToSeller,
    RefundToBuyer,
}

/// Dispute record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeInfo {
    pub raised_by: PartyId,
    pub reason: String,
    pub raised_at: DateTime<Utc>,
    pub resolution: Option<DisputeResolution>,
    pub resolved_by: Option<PartyId>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Settlement creation input
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementDraft {
    pub asset_id: AssetId,
    pub buyer: PartyId,
    pub seller: PartyId,
    pub amount: Decimal,
    pub deadline: DateTime<Utc>,
    pub memo: Option<String>,
}

impl SettlementDraft {
    pub fn new(
        asset_id: AssetId,
        buyer: PartyId,
        seller: PartyId,
        amount: Decimal,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            asset_id,
            buyer,
            seller,
            amount,
            deadline,
            memo: None,
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    pub fn validate(&self, now: DateTime<Utc>) -> AcseResult<()> {
        if self.amount <= Decimal::ZERO {
            return Err(AcseError::InvalidSettlement {
                reason: format!("amount must be positive, got {}", self.amount),
            });
        }
        if self.amount > max_settlement_amount() {
            return Err(AcseError::InvalidSettlement {
                reason: format!(
                    "amount {} exceeds the maximum {}",
                    self.amount,
                    max_settlement_amount()
                ),
            });
        }
        if self.buyer == self.seller {
            return Err(AcseError::InvalidSettlement {
                reason: "buyer and seller must differ".to_string(),
            });
        }
        if self.deadline <= now {
            return Err(AcseError::InvalidSettlement {
                reason: "deadline must be in the future".to_string(),
            });
        }
        Ok(())
    }
}

/// An escrowed trade
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub settlement_id: SettlementId,
    pub asset_id: AssetId,
    /// Request whose VERIFIED status gated creation
    pub verified_request_id: RequestId,
    pub buyer: PartyId,
    pub seller: PartyId,
    pub amount: Decimal,
    /// Fee rate captured at creation
    pub fee_bps: u32,
    pub memo: Option<String>,
    pub deadline: DateTime<Utc>,
    pub status: SettlementStatus,
    /// Valuation window for the asset's category
    pub buffer_period_secs: Option<u64>,
    /// Claimed transfer not yet committed
    pub transfer_in_flight: Option<TransferKind>,
    /// Rail references of committed transfers, in order
    pub transfer_refs: Vec<String>,
    pub dispute: Option<DisputeInfo>,
    pub released_to_seller: Decimal,
    pub fee_collected: Decimal,
    pub refunded_to_buyer: Decimal,
    pub created_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Settlement {
    /// Open a settlement from a validated draft
    pub fn open(
        draft: SettlementDraft,
        verified_request_id: RequestId,
        fee_bps: u32,
        buffer_period_secs: Option<u64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            settlement_id: SettlementId::generate(),
            asset_id: draft.asset_id,
            verified_request_id,
            buyer: draft.buyer,
            seller: draft.seller,
            amount: draft.amount,
            fee_bps,
            memo: draft.memo,
            deadline: draft.deadline,
            status: SettlementStatus::Created,
            buffer_period_secs,
            transfer_in_flight: None,
            transfer_refs: Vec::new(),
            dispute: None,
            released_to_seller: Decimal::ZERO,
            fee_collected: Decimal::ZERO,
            refunded_to_buyer: Decimal::ZERO,
            created_at: now,
            funded_at: None,
            closed_at: None,
            updated_at: now,
        }
    }

    /// Check if status transition is valid
    pub fn is_valid_transition(&self, to: SettlementStatus) -> bool {
        use SettlementStatus::*;
        matches!(
            (self.status, to),
            (Created, Funded)
                | (Created, Expired)
                | (Funded, Confirmed)
                | (Funded, Refunded)
                | (Funded, Disputed)
                | (Funded, Expired)
                | (Disputed, Confirmed)
                | (Disputed, Refunded)
        )
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    fn id(&self) -> String {
        self.settlement_id.to_string()
    }

    fn closed(&self) -> AcseError {
        AcseError::SettlementClosed {
            settlement_id: self.id(),
            status: self.status.to_string(),
        }
    }

    fn ensure_idle(&self) -> AcseResult<()> {
        if self.transfer_in_flight.is_some() {
            return Err(AcseError::TransferInFlight {
                settlement_id: self.id(),
            });
        }
        Ok(())
    }

    /// CREATED -> FUNDED precondition
    pub fn check_fund(&self, now: DateTime<Utc>) -> AcseResult<()> {
        self.ensure_idle()?;
        match self.status {
            SettlementStatus::Created if self.is_past_deadline(now) => Err(AcseError::Expired {
                settlement_id: self.id(),
            }),
            SettlementStatus::Created => Ok(()),
            SettlementStatus::Expired => Err(AcseError::Expired {
                settlement_id: self.id(),
            }),
            _ => Err(AcseError::AlreadyFunded {
                settlement_id: self.id(),
            }),
        }
    }

    /// FUNDED -> CONFIRMED precondition (the price check is separate)
    pub fn check_confirm(&self, now: DateTime<Utc>) -> AcseResult<()> {
        self.ensure_idle()?;
        match self.status {
            SettlementStatus::Created => Err(AcseError::NotFunded {
                settlement_id: self.id(),
            }),
            SettlementStatus::Disputed => Err(AcseError::SettlementDisputed {
                settlement_id: self.id(),
            }),
            SettlementStatus::Expired => Err(AcseError::Expired {
                settlement_id: self.id(),
            }),
            SettlementStatus::Confirmed | SettlementStatus::Refunded => Err(self.closed()),
            SettlementStatus::Funded if self.is_past_deadline(now) => Err(AcseError::Expired {
                settlement_id: self.id(),
            }),
            SettlementStatus::Funded => Ok(()),
        }
    }

    /// Buyer-initiated FUNDED -> REFUNDED precondition
    pub fn check_refund(&self, requested_by: &PartyId, now: DateTime<Utc>) -> AcseResult<()> {
        if requested_by != &self.buyer {
            return Err(AcseError::Unauthorized {
                caller: requested_by.to_string(),
                action: format!("refund settlement {}", self.settlement_id),
            });
        }
        self.check_funded_open(now)
    }

    /// FUNDED -> DISPUTED precondition
    pub fn check_dispute(&self, raised_by: &PartyId, now: DateTime<Utc>) -> AcseResult<()> {
        if raised_by != &self.buyer && raised_by != &self.seller {
            return Err(AcseError::Unauthorized {
                caller: raised_by.to_string(),
                action: format!("dispute settlement {}", self.settlement_id),
            });
        }
        self.check_funded_open(now)
    }

    fn check_funded_open(&self, now: DateTime<Utc>) -> AcseResult<()> {
        self.ensure_idle()?;
        match self.status {
            SettlementStatus::Created => Err(AcseError::NotFunded {
                settlement_id: self.id(),
            }),
            SettlementStatus::Disputed => Err(AcseError::SettlementDisputed {
                settlement_id: self.id(),
            }),
            SettlementStatus::Expired => Err(AcseError::Expired {
                settlement_id: self.id(),
            }),
            SettlementStatus::Confirmed | SettlementStatus::Refunded => Err(self.closed()),
            SettlementStatus::Funded if self.is_past_deadline(now) => Err(AcseError::Expired {
                settlement_id: self.id(),
            }),
            SettlementStatus::Funded => Ok(()),
        }
    }

    /// DISPUTED -> {CONFIRMED, REFUNDED} precondition
    pub fn check_resolve(&self) -> AcseResult<()> {
        self.ensure_idle()?;
        if self.status.is_terminal() {
            return Err(self.closed());
        }
        if self.status != SettlementStatus::Disputed {
            return Err(AcseError::NotDisputed {
                settlement_id: self.id(),
            });
        }
        Ok(())
    }

    /// Whether the sweep should act on this settlement
    pub fn is_sweepable(&self, now: DateTime<Utc>) -> bool {
        self.transfer_in_flight.is_none()
            && matches!(
                self.status,
                SettlementStatus::Created | SettlementStatus::Funded
            )
            && self.is_past_deadline(now)
    }

    /// Record a claimed transfer
    pub fn claim_transfer(&mut self, kind: TransferKind, now: DateTime<Utc>) -> AcseResult<()> {
        self.ensure_idle()?;
        self.transfer_in_flight = Some(kind);
        self.updated_at = now;
        Ok(())
    }

    /// Clear a claim after a failed transfer
    pub fn abandon_transfer(&mut self, now: DateTime<Utc>) {
        self.transfer_in_flight = None;
        self.updated_at = now;
    }

    fn transition(&mut self, to: SettlementStatus, now: DateTime<Utc>) -> AcseResult<()> {
        if !self.is_valid_transition(to) {
            return Err(AcseError::invariant(
                "settlement transition",
                format!("{} -> {} for {}", self.status, to, self.settlement_id),
            ));
        }
        self.status = to;
        self.transfer_in_flight = None;
        self.updated_at = now;
        if to.is_terminal() {
            self.closed_at = Some(now);
        }
        Ok(())
    }

    /// Commit a completed hold
    pub fn commit_funded(&mut self, reference: String, now: DateTime<Utc>) -> AcseResult<()> {
        self.transition(SettlementStatus::Funded, now)?;
        self.funded_at = Some(now);
        self.transfer_refs.push(reference);
        Ok(())
    }

    /// Commit a completed release; returns (seller amount, fee)
    pub fn commit_confirmed(
        &mut self,
        reference: String,
        now: DateTime<Utc>,
    ) -> AcseResult<(Decimal, Decimal)> {
        let (to_seller, fee) = split_fee(self.amount, self.fee_bps)?;
        self.transition(SettlementStatus::Confirmed, now)?;
        self.released_to_seller = to_seller;
        self.fee_collected = fee;
        self.transfer_refs.push(reference);
        self.verify_escrow()?;
        Ok((to_seller, fee))
    }

    /// Commit a completed refund (buyer request or arbiter decision)
    pub fn commit_refunded(&mut self, reference: String, now: DateTime<Utc>) -> AcseResult<()> {
        self.transition(SettlementStatus::Refunded, now)?;
        self.refunded_to_buyer = self.amount;
        self.transfer_refs.push(reference);
        self.verify_escrow()
    }

    /// Commit expiry; `refund_ref` is set when escrow was returned
    pub fn commit_expired(&mut self, refund_ref: Option<String>, now: DateTime<Utc>) -> AcseResult<()> {
        let was_funded = self.status == SettlementStatus::Funded;
        if was_funded && refund_ref.is_none() {
            return Err(AcseError::invariant(
                "escrow conservation",
                format!("{} expired while funded without a refund", self.settlement_id),
            ));
        }
        self.transition(SettlementStatus::Expired, now)?;
        if let Some(reference) = refund_ref {
            self.refunded_to_buyer = self.amount;
            self.transfer_refs.push(reference);
        }
        self.verify_escrow()
    }

    /// Record a dispute
    pub fn mark_disputed(
        &mut self,
        raised_by: PartyId,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> AcseResult<()> {
        self.transition(SettlementStatus::Disputed, now)?;
        self.dispute = Some(DisputeInfo {
            raised_by,
            reason: reason.into(),
            raised_at: now,
            resolution: None,
            resolved_by: None,
            resolved_at: None,
        });
        Ok(())
    }

    /// Stamp the arbiter's decision on the dispute record
    pub fn record_resolution(
        &mut self,
        resolution: DisputeResolution,
        arbiter: PartyId,
        now: DateTime<Utc>,
    ) {
        if let Some(dispute) = self.dispute.as_mut() {
            dispute.resolution = Some(resolution);
            dispute.resolved_by = Some(arbiter);
            dispute.resolved_at = Some(now);
        }
    }

    /// Escrow accounting check for the current status
    pub fn verify_escrow(&self) -> AcseResult<()> {
        let released = self.released_to_seller + self.fee_collected;
        let refunded = self.refunded_to_buyer;
        let ok = match self.status {
            SettlementStatus::Confirmed => released == self.amount && refunded.is_zero(),
            SettlementStatus::Refunded => refunded == self.amount && released.is_zero(),
            SettlementStatus::Expired if self.funded_at.is_some() => {
                refunded == self.amount && released.is_zero()
            }
            _ => released.is_zero() && refunded.is_zero(),
        };
        if ok {
            Ok(())
        } else {
            Err(AcseError::invariant(
                "escrow conservation",
                format!(
                    "{} {}: amount {}, seller {}, fee {}, buyer {}",
                    self.settlement_id,
                    self.status,
                    self.amount,
                    self.released_to_seller,
                    self.fee_collected,
                    self.refunded_to_buyer
                ),
            ))
        }
    }
}

/// Largest amount a settlement may escrow
pub fn max_settlement_amount() -> Decimal {
    Decimal::new(1_000_000_000_000_000, 0)
}

/// Split `amount` into (seller share, fee). Fee rounds toward zero at the
/// amount's precision (minimum two places), so the parts always sum to `amount`.
pub fn split_fee(amount: Decimal, fee_bps: u32) -> AcseResult<(Decimal, Decimal)> {
    let raw = amount
        .checked_mul(Decimal::from(fee_bps))
        .and_then(|scaled| scaled.checked_div(Decimal::from(10_000u32)))
        .ok_or_else(|| AcseError::InvalidAmount {
            reason: format!("fee of {} bps on {} overflows", fee_bps, amount),
        })?;
    let fee = raw.round_dp_with_strategy(amount.scale().max(2), RoundingStrategy::ToZero);
    Ok((amount - fee, fee))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn settlement() -> Settlement {
        let now = Utc::now();
        let draft = SettlementDraft::new(
            AssetId::new("asset:farm-1"),
            PartyId::new("buyer"),
            PartyId::new("seller"),
            Decimal::new(10_000, 0),
            now + Duration::days(30),
        );
        Settlement::open(draft, RequestId::new("req:1"), 250, None, now)
    }

    #[test]
    fn test_fee_split() {
        assert_eq!(
            split_fee(Decimal::new(10_000, 0), 250).unwrap(),
            (Decimal::new(9_750, 0), Decimal::new(250, 0))
        );
        let (seller, fee) = split_fee(Decimal::new(333, 2), 250).unwrap();
        assert_eq!(seller + fee, Decimal::new(333, 2));
        assert_eq!(fee, Decimal::new(8, 2));

        let (seller, fee) = split_fee(max_settlement_amount(), 9_999).unwrap();
        assert_eq!(seller + fee, max_settlement_amount());
    }

    #[test]
    fn test_fee_overflow_is_an_error() {
        assert!(matches!(
            split_fee(Decimal::MAX, 250),
            Err(AcseError::InvalidAmount { .. })
        ));

        let mut s = settlement();
        s.amount = Decimal::MAX;
        let now = Utc::now();
        s.commit_funded("hold-1".into(), now).unwrap();
        s.claim_transfer(TransferKind::Release, now).unwrap();
        assert!(s.commit_confirmed("rel-1".into(), now).is_err());
        assert_eq!(s.status, SettlementStatus::Funded);
    }

    #[test]
    fn test_draft_validation() {
        let now = Utc::now();
        let mut draft = SettlementDraft::new(
            AssetId::new("a"),
            PartyId::new("p"),
            PartyId::new("p"),
            Decimal::ONE,
            now + Duration::days(1),
        );
        assert!(draft.validate(now).is_err());
        draft.seller = PartyId::new("q");
        assert!(draft.validate(now).is_ok());
        draft.amount = Decimal::ZERO;
        assert!(draft.validate(now).is_err());
        draft.amount = max_settlement_amount();
        assert!(draft.validate(now).is_ok());
        draft.amount = Decimal::MAX;
        assert!(matches!(
            draft.validate(now),
            Err(AcseError::InvalidSettlement { .. })
        ));
    }

    #[test]
    fn test_happy_path_accounting() {
        let mut s = settlement();
        let now = Utc::now();
        s.check_fund(now).unwrap();
        s.claim_transfer(TransferKind::Hold, now).unwrap();
        assert!(matches!(s.check_confirm(now), Err(AcseError::TransferInFlight { .. })));
        s.commit_funded("hold-1".into(), now).unwrap();
        assert!(matches!(s.check_fund(now), Err(AcseError::AlreadyFunded { .. })));

        s.check_confirm(now).unwrap();
        s.claim_transfer(TransferKind::Release, now).unwrap();
        let (seller, fee) = s.commit_confirmed("rel-1".into(), now).unwrap();
        assert_eq!(seller + fee, s.amount);
        assert_eq!(s.status, SettlementStatus::Confirmed);
        assert!(s.transfer_in_flight.is_none());
        assert!(matches!(
            s.check_confirm(now),
            Err(AcseError::SettlementClosed { .. })
        ));
    }

    #[test]
    fn test_confirm_requires_funding() {
        let s = settlement();
        assert!(matches!(
            s.check_confirm(Utc::now()),
            Err(AcseError::NotFunded { .. })
        ));
    }

    #[test]
    fn test_refund_rules() {
        let mut s = settlement();
        let now = Utc::now();
        s.commit_funded("hold-1".into(), now).unwrap();
        assert!(matches!(
            s.check_refund(&PartyId::new("seller"), now),
            Err(AcseError::Unauthorized { .. })
        ));
        let late = s.deadline + Duration::seconds(1);
        assert!(matches!(
            s.check_refund(&PartyId::new("buyer"), late),
            Err(AcseError::Expired { .. })
        ));
        s.check_refund(&PartyId::new("buyer"), now).unwrap();
        s.commit_refunded("ref-1".into(), now).unwrap();
        assert_eq!(s.refunded_to_buyer, s.amount);
    }

    #[test]
    fn test_dispute_blocks_confirm() {
        let mut s = settlement();
        let now = Utc::now();
        s.commit_funded("hold-1".into(), now).unwrap();
        s.check_dispute(&PartyId::new("seller"), now).unwrap();
        s.mark_disputed(PartyId::new("seller"), "goods not delivered", now)
            .unwrap();
        assert!(matches!(
            s.check_confirm(now),
            Err(AcseError::SettlementDisputed { .. })
        ));
        assert!(s.check_resolve().is_ok());
        assert!(!s.is_sweepable(s.deadline + Duration::days(1)));
    }

    #[test]
    fn test_expiry_of_funded_requires_refund() {
        let mut s = settlement();
        let now = Utc::now();
        s.commit_funded("hold-1".into(), now).unwrap();
        assert!(s.commit_expired(None, now).is_err());
        assert_eq!(s.status, SettlementStatus::Funded);
        s.commit_expired(Some("ref-1".into()), now).unwrap();
        assert_eq!(s.status, SettlementStatus::Expired);
        assert_eq!(s.refunded_to_buyer, s.amount);
    }

    #[test]
    fn test_invalid_transition_is_fatal() {
        let mut s = settlement();
        let err = s.commit_refunded("x".into(), Utc::now()).unwrap_err();
        assert!(matches!(err, AcseError::InvariantViolation { .. }));
    }
}
