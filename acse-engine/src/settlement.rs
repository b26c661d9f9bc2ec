//! Settlement Engine
//!
//! Escrowed trades: `CREATED -> FUNDED -> CONFIRMED`, `FUNDED -> REFUNDED`,
//! `FUNDED -> DISPUTED -> {CONFIRMED, REFUNDED}`, `CREATED|FUNDED -> EXPIRED`.
//!
//! Every funds movement is claim / call / commit:
//! 1. under the settlement lock, check the transition and record a
//!    `transfer_in_flight` marker;
//! 2. without the lock, call the funds rail under the collaborator timeout;
//! 3. re-lock and either commit the transition or clear the marker.
//!
//! Steps 2 and 3 run in a spawned task, so a caller that goes away mid-call
//! cannot leave the marker behind after the rail has answered. The rail
//! reference is `"{settlement_id}:{hold|release|refund}"` for every attempt.
//!
//! A marker can still outlive its task (process crash, failed save after the
//! rail answered). The expiry sweep treats a marker older than twice the
//! collaborator timeout as stale: it re-issues the same rail reference and
//! then commits or clears the claim.

use std::sync::Arc;
use std::time::Duration;

use acse_core::{
    split_fee, AcseError, AcseResult, Caller, Clock, DisputeResolution, DomainEvent, PartyId,
    Role, Settlement, SettlementDraft, SettlementId, SettlementStatus, TransferKind,
    VerificationStatus,
};
use acse_store::EngineStorage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::collaborators::{guarded, FundsRail, TransferReceipt, FUNDS_RAIL};
use crate::config::SettlementConfig;
use crate::consensus::TrustGate;
use crate::events::EventBus;
use crate::locks::EntityLocks;
use crate::valuation::ValuationBuffer;

/// Party recorded as arbiter when a stale dispute payout is re-issued
const RECOVERY_PARTY: &str = "acse-recovery";

/// Result of one settlement expiry sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementSweepReport {
    pub examined: usize,
    /// Stale transfer claims re-issued and committed
    pub recovered: Vec<SettlementId>,
    /// Expired without funds (CREATED)
    pub expired: Vec<SettlementId>,
    /// Expired with escrow returned to the buyer (FUNDED)
    pub refunded: Vec<SettlementId>,
    /// Refunds or recoveries that failed and are retried next sweep
    pub failed: usize,
}

/// Transition applied once the rail confirms a movement
#[derive(Debug, Clone)]
enum Completion {
    Fund,
    Confirm,
    Refund,
    ResolveRelease(PartyId),
    ResolveRefund(PartyId),
    Expire,
}

impl Completion {
    fn kind(&self) -> TransferKind {
        match self {
            Self::Fund => TransferKind::Hold,
            Self::Confirm | Self::ResolveRelease(_) => TransferKind::Release,
            Self::Refund | Self::ResolveRefund(_) | Self::Expire => TransferKind::Refund,
        }
    }

    fn commit(
        self,
        settlement: &mut Settlement,
        reference: String,
        now: DateTime<Utc>,
    ) -> AcseResult<Vec<DomainEvent>> {
        let settlement_id = settlement.settlement_id.clone();
        let events = match self {
            Self::Fund => {
                settlement.commit_funded(reference, now)?;
                vec![DomainEvent::SettlementFunded {
                    settlement_id,
                    at: now,
                }]
            }
            Self::Confirm => {
                let (released_to_seller, fee) = settlement.commit_confirmed(reference, now)?;
                vec![DomainEvent::SettlementConfirmed {
                    settlement_id,
                    released_to_seller,
                    fee,
                    at: now,
                }]
            }
            Self::Refund => {
                settlement.commit_refunded(reference, now)?;
                vec![DomainEvent::SettlementRefunded {
                    settlement_id,
                    amount: settlement.amount,
                    at: now,
                }]
            }
            Self::ResolveRelease(arbiter) => {
                settlement.record_resolution(DisputeResolution::ReleaseToSeller, arbiter, now);
                let (released_to_seller, fee) = settlement.commit_confirmed(reference, now)?;
                vec![
                    DomainEvent::SettlementDisputeResolved {
                        settlement_id: settlement_id.clone(),
                        resolution: DisputeResolution::ReleaseToSeller,
                        at: now,
                    },
                    DomainEvent::SettlementConfirmed {
                        settlement_id,
                        released_to_seller,
                        fee,
                        at: now,
                    },
                ]
            }
            Self::ResolveRefund(arbiter) => {
                settlement.record_resolution(DisputeResolution::RefundToBuyer, arbiter, now);
                settlement.commit_refunded(reference, now)?;
                vec![
                    DomainEvent::SettlementDisputeResolved {
                        settlement_id: settlement_id.clone(),
                        resolution: DisputeResolution::RefundToBuyer,
                        at: now,
                    },
                    DomainEvent::SettlementRefunded {
                        settlement_id,
                        amount: settlement.amount,
                        at: now,
                    },
                ]
            }
            Self::Expire => {
                settlement.commit_expired(Some(reference), now)?;
                vec![DomainEvent::SettlementExpired {
                    settlement_id,
                    refunded: true,
                    at: now,
                }]
            }
        };
        Ok(events)
    }
}

#[derive(Clone)]
pub struct SettlementEngine {
    storage: Arc<dyn EngineStorage>,
    trust: Arc<dyn TrustGate>,
    valuation: Arc<ValuationBuffer>,
    rail: Arc<dyn FundsRail>,
    locks: Arc<EntityLocks<SettlementId>>,
    config: SettlementConfig,
    timeout: Duration,
    stale_claim_after: chrono::Duration,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl SettlementEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn EngineStorage>,
        trust: Arc<dyn TrustGate>,
        valuation: Arc<ValuationBuffer>,
        rail: Arc<dyn FundsRail>,
        config: SettlementConfig,
        timeout: Duration,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            trust,
            valuation,
            rail,
            locks: Arc::new(EntityLocks::new()),
            config,
            timeout,
            stale_claim_after: chrono::Duration::from_std(timeout.saturating_mul(2))
                .unwrap_or_else(|_| chrono::Duration::weeks(52)),
            events,
            clock,
        }
    }

    /// Open a settlement. The asset must be VERIFIED now; later changes do not
    /// affect the settlement.
    pub async fn create(&self, draft: SettlementDraft) -> AcseResult<Settlement> {
        let now = self.clock.now();
        draft.validate(now)?;

        let trust = self
            .trust
            .asset_trust(&draft.asset_id)
            .await?
            .filter(|t| t.status == VerificationStatus::Verified)
            .ok_or_else(|| AcseError::AssetNotVerified {
                asset_id: draft.asset_id.to_string(),
            })?;

        let settlement = Settlement::open(
            draft,
            trust.request_id,
            self.config.fee_bps,
            trust.buffer_period_secs,
            now,
        );
        self.storage.save_settlement(&settlement).await?;

        info!(
            settlement_id = %settlement.settlement_id,
            asset_id = %settlement.asset_id,
            amount = %settlement.amount,
            deadline = %settlement.deadline,
            "Settlement created"
        );
        self.events.publish(DomainEvent::SettlementCreated {
            settlement_id: settlement.settlement_id.clone(),
            asset_id: settlement.asset_id.clone(),
            buyer: settlement.buyer.clone(),
            seller: settlement.seller.clone(),
            amount: settlement.amount,
            at: now,
        });
        Ok(settlement)
    }

    /// Hold buyer funds in escrow: CREATED -> FUNDED
    pub async fn fund(&self, settlement_id: &SettlementId) -> AcseResult<Settlement> {
        self.run_transfer(settlement_id, Completion::Fund, |s, now| s.check_fund(now))
            .await
    }

    /// Release escrow to the seller minus the fee: FUNDED -> CONFIRMED.
    /// Requires a valuation within tolerance at commit time.
    pub async fn confirm(&self, settlement_id: &SettlementId) -> AcseResult<Settlement> {
        let current = self.load(settlement_id).await?;
        current.check_confirm(self.clock.now())?;
        self.valuation
            .refresh_if_configured(&current.asset_id, current.buffer_period_secs)
            .await?;

        let valuation = self.valuation.clone();
        self.run_transfer(settlement_id, Completion::Confirm, move |s, now| {
            s.check_confirm(now)?;
            split_fee(s.amount, s.fee_bps)?;
            valuation.check_fresh(&s.asset_id, s.buffer_period_secs)?;
            Ok(())
        })
        .await
    }

    /// Buyer-initiated refund before the deadline: FUNDED -> REFUNDED
    pub async fn refund(
        &self,
        settlement_id: &SettlementId,
        requested_by: &PartyId,
    ) -> AcseResult<Settlement> {
        let requested_by = requested_by.clone();
        self.run_transfer(settlement_id, Completion::Refund, move |s, now| {
            s.check_refund(&requested_by, now)
        })
        .await
    }

    /// Buyer or seller contests a funded settlement: FUNDED -> DISPUTED
    pub async fn dispute(
        &self,
        settlement_id: &SettlementId,
        raised_by: &PartyId,
        reason: &str,
    ) -> AcseResult<Settlement> {
        let _guard = self.locks.lock(settlement_id).await;
        let mut settlement = self.load(settlement_id).await?;
        let now = self.clock.now();

        settlement.check_dispute(raised_by, now)?;
        settlement.mark_disputed(raised_by.clone(), reason, now)?;
        self.storage.save_settlement(&settlement).await?;

        warn!(
            settlement_id = %settlement_id,
            raised_by = %raised_by,
            "Settlement disputed: {}",
            reason
        );
        self.events.publish(DomainEvent::SettlementDisputed {
            settlement_id: settlement_id.clone(),
            raised_by: raised_by.clone(),
            at: now,
        });
        Ok(settlement)
    }

    /// Arbiter decision on a disputed settlement
    pub async fn resolve_dispute(
        &self,
        settlement_id: &SettlementId,
        caller: &Caller,
        resolution: DisputeResolution,
    ) -> AcseResult<Settlement> {
        caller.require(Role::Arbiter, "resolve_dispute")?;
        let arbiter = caller.party.clone();

        match resolution {
            DisputeResolution::ReleaseToSeller => {
                let current = self.load(settlement_id).await?;
                current.check_resolve()?;
                self.valuation
                    .refresh_if_configured(&current.asset_id, current.buffer_period_secs)
                    .await?;

                let valuation = self.valuation.clone();
                self.run_transfer(
                    settlement_id,
                    Completion::ResolveRelease(arbiter),
                    move |s, _| {
                        s.check_resolve()?;
                        split_fee(s.amount, s.fee_bps)?;
                        valuation.check_fresh(&s.asset_id, s.buffer_period_secs)?;
                        Ok(())
                    },
                )
                .await
            }
            DisputeResolution::RefundToBuyer => {
                self.run_transfer(settlement_id, Completion::ResolveRefund(arbiter), |s, _| {
                    s.check_resolve()
                })
                .await
            }
        }
    }

    pub async fn get(&self, settlement_id: &SettlementId) -> AcseResult<Settlement> {
        self.load(settlement_id).await
    }

    /// Expire overdue CREATED and FUNDED settlements; FUNDED ones are refunded
    /// first. Idempotent. Disputed settlements wait for the arbiter.
    ///
    /// Stale transfer claims are recovered before the expiry pass.
    pub async fn sweep_expired(&self) -> AcseResult<SettlementSweepReport> {
        let now = self.clock.now();
        let mut report = SettlementSweepReport::default();

        for status in [
            SettlementStatus::Created,
            SettlementStatus::Funded,
            SettlementStatus::Disputed,
        ] {
            let open = self.storage.list_settlements_by_status(status).await?;
            for candidate in open.into_iter().filter(|s| self.is_stale_claim(s, now)) {
                let settlement_id = candidate.settlement_id;
                match self.recover_claim(&settlement_id, now).await {
                    Ok(Some(_)) => report.recovered.push(settlement_id),
                    Ok(None) => {}
                    Err(e) => {
                        error!(
                            settlement_id = %settlement_id,
                            error = %e,
                            "Stale transfer claim not recovered"
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        let created = self
            .storage
            .list_settlements_by_status(SettlementStatus::Created)
            .await?;
        report.examined += created.len();
        for candidate in created.into_iter().filter(|s| s.is_sweepable(now)) {
            let settlement_id = candidate.settlement_id;
            match self.expire_unfunded(&settlement_id, now).await {
                Ok(true) => report.expired.push(settlement_id),
                Ok(false) => {}
                Err(e) => {
                    error!(settlement_id = %settlement_id, error = %e, "Failed to expire settlement");
                    report.failed += 1;
                }
            }
        }

        let funded = self
            .storage
            .list_settlements_by_status(SettlementStatus::Funded)
            .await?;
        report.examined += funded.len();
        for candidate in funded.into_iter().filter(|s| s.is_sweepable(now)) {
            let settlement_id = candidate.settlement_id;
            let result = self
                .run_transfer(&settlement_id, Completion::Expire, |s, now| {
                    if s.status == SettlementStatus::Funded && s.is_sweepable(now) {
                        Ok(())
                    } else {
                        Err(AcseError::SettlementClosed {
                            settlement_id: s.settlement_id.to_string(),
                            status: s.status.to_string(),
                        })
                    }
                })
                .await;
            match result {
                Ok(_) => report.refunded.push(settlement_id),
                Err(e) if e.is_retryable() => {
                    error!(
                        settlement_id = %settlement_id,
                        error = %e,
                        "Expiry refund failed, settlement stays FUNDED"
                    );
                    report.failed += 1;
                }
                // a foreground call got there first
                Err(e) => debug!(settlement_id = %settlement_id, error = %e, "Sweep skipped settlement"),
            }
        }

        if !report.expired.is_empty() || !report.refunded.is_empty() || !report.recovered.is_empty() {
            info!(
                expired = report.expired.len(),
                refunded = report.refunded.len(),
                recovered = report.recovered.len(),
                "Expired overdue settlements"
            );
        }
        Ok(report)
    }

    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }

    fn is_stale_claim(&self, settlement: &Settlement, now: DateTime<Utc>) -> bool {
        settlement.transfer_in_flight.is_some() && now - settlement.updated_at > self.stale_claim_after
    }

    /// Re-issue the rail call behind a stale marker. The reference is the one
    /// the original attempt used, so a rail that already moved the funds
    /// answers with the earlier receipt.
    async fn recover_claim(
        &self,
        settlement_id: &SettlementId,
        now: DateTime<Utc>,
    ) -> AcseResult<Option<Settlement>> {
        let claimed = {
            let _guard = self.locks.lock(settlement_id).await;
            let current = self.load(settlement_id).await?;
            if !self.is_stale_claim(&current, now) {
                return Ok(None);
            }
            current
        };
        let Some(kind) = claimed.transfer_in_flight else {
            return Ok(None);
        };

        let recovery = PartyId::new(RECOVERY_PARTY);
        let completion = match (kind, claimed.status) {
            (TransferKind::Hold, _) => Completion::Fund,
            (TransferKind::Release, SettlementStatus::Disputed) => Completion::ResolveRelease(recovery),
            (TransferKind::Release, _) => Completion::Confirm,
            (TransferKind::Refund, SettlementStatus::Disputed) => Completion::ResolveRefund(recovery),
            // claimed by the expiry sweep
            (TransferKind::Refund, _) if claimed.is_past_deadline(claimed.updated_at) => Completion::Expire,
            (TransferKind::Refund, _) => Completion::Refund,
        };
        warn!(
            settlement_id = %settlement_id,
            kind = %kind,
            claimed_at = %claimed.updated_at,
            "Re-issuing stale transfer claim"
        );
        self.spawn_transfer(claimed, completion).await.map(Some)
    }

    async fn expire_unfunded(
        &self,
        settlement_id: &SettlementId,
        now: DateTime<Utc>,
    ) -> AcseResult<bool> {
        let _guard = self.locks.lock(settlement_id).await;
        let mut settlement = self.load(settlement_id).await?;
        if settlement.status != SettlementStatus::Created || !settlement.is_sweepable(now) {
            return Ok(false);
        }
        settlement.commit_expired(None, now)?;
        self.storage.save_settlement(&settlement).await?;

        info!(settlement_id = %settlement_id, "Settlement expired unfunded");
        self.events.publish(DomainEvent::SettlementExpired {
            settlement_id: settlement_id.clone(),
            refunded: false,
            at: now,
        });
        Ok(true)
    }

    async fn load(&self, settlement_id: &SettlementId) -> AcseResult<Settlement> {
        self.storage
            .get_settlement(settlement_id)
            .await?
            .ok_or_else(|| AcseError::SettlementNotFound {
                settlement_id: settlement_id.to_string(),
            })
    }

    /// Claim under the lock, then hand the rail call and commit to a task
    async fn run_transfer<F>(
        &self,
        settlement_id: &SettlementId,
        completion: Completion,
        check: F,
    ) -> AcseResult<Settlement>
    where
        F: FnOnce(&Settlement, DateTime<Utc>) -> AcseResult<()>,
    {
        let kind = completion.kind();
        let claimed = {
            let _guard = self.locks.lock(settlement_id).await;
            let mut settlement = self.load(settlement_id).await?;
            let now = self.clock.now();
            check(&settlement, now)?;
            settlement.claim_transfer(kind, now)?;
            self.storage.save_settlement(&settlement).await?;
            settlement
        };
        debug!(settlement_id = %settlement_id, kind = %kind, "Transfer claimed");

        self.spawn_transfer(claimed, completion).await
    }

    /// Run call and commit on its own task. If the task dies the marker is
    /// cleared so the settlement is not wedged.
    async fn spawn_transfer(
        &self,
        claimed: Settlement,
        completion: Completion,
    ) -> AcseResult<Settlement> {
        let kind = completion.kind();
        let settlement_id = claimed.settlement_id.clone();
        let engine = self.clone();
        let joined = tokio::spawn(async move { engine.call_and_commit(claimed, completion).await }).await;

        match joined {
            Ok(result) => result,
            Err(e) => {
                error!(settlement_id = %settlement_id, kind = %kind, error = %e, "Transfer task aborted");
                self.release_claim(&settlement_id, kind).await?;
                Err(AcseError::CollaboratorFailed {
                    collaborator: FUNDS_RAIL.to_string(),
                    reason: format!("transfer task aborted: {}", e),
                })
            }
        }
    }

    async fn release_claim(&self, settlement_id: &SettlementId, kind: TransferKind) -> AcseResult<()> {
        let _guard = self.locks.lock(settlement_id).await;
        let mut settlement = self.load(settlement_id).await?;
        if settlement.transfer_in_flight == Some(kind) {
            settlement.abandon_transfer(self.clock.now());
            self.storage.save_settlement(&settlement).await?;
            warn!(settlement_id = %settlement_id, kind = %kind, "Claim released after task abort");
        }
        Ok(())
    }

    async fn call_and_commit(
        self,
        claimed: Settlement,
        completion: Completion,
    ) -> AcseResult<Settlement> {
        let kind = completion.kind();
        let outcome = self.call_rail(&claimed, kind).await;
        let settlement_id = claimed.settlement_id;

        let _guard = self.locks.lock(&settlement_id).await;
        let mut settlement = self.load(&settlement_id).await?;
        if settlement.transfer_in_flight != Some(kind) {
            return Err(AcseError::invariant(
                "transfer claim",
                format!(
                    "{} lost its {} marker (found {:?})",
                    settlement_id, kind, settlement.transfer_in_flight
                ),
            ));
        }
        let now = self.clock.now();

        match outcome {
            Ok(receipt) => {
                let from = settlement.status;
                let events = match completion.commit(&mut settlement, receipt.reference, now) {
                    Ok(events) => events,
                    Err(e) => {
                        error!(settlement_id = %settlement_id, error = %e, "Transfer commit failed");
                        return Err(e);
                    }
                };
                self.storage.save_settlement(&settlement).await?;
                info!(
                    settlement_id = %settlement_id,
                    from = %from,
                    status = %settlement.status,
                    "Settlement transition committed"
                );
                for event in events {
                    self.events.publish(event);
                }
                Ok(settlement)
            }
            Err(e) => {
                settlement.abandon_transfer(now);
                self.storage.save_settlement(&settlement).await?;
                warn!(
                    settlement_id = %settlement_id,
                    kind = %kind,
                    error = %e,
                    "Transfer failed, claim released"
                );
                Err(e)
            }
        }
    }

    async fn call_rail(&self, settlement: &Settlement, kind: TransferKind) -> AcseResult<TransferReceipt> {
        let reference = format!("{}:{}", settlement.settlement_id, kind);
        let escrow = PartyId::new(self.config.escrow_account.clone());
        let call = match kind {
            TransferKind::Hold => {
                self.rail
                    .hold(&settlement.buyer, &escrow, settlement.amount, &reference)
            }
            TransferKind::Release => {
                let (to_seller, _fee) = split_fee(settlement.amount, settlement.fee_bps)?;
                self.rail
                    .release(&escrow, &settlement.seller, to_seller, &reference)
            }
            TransferKind::Refund => {
                self.rail
                    .refund(&escrow, &settlement.buyer, settlement.amount, &reference)
            }
        };
        guarded(FUNDS_RAIL, self.timeout, call).await
    }
}
