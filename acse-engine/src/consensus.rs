//! Consensus Engine
//!
//! Drives each verification request through `PENDING -> {VERIFIED, REJECTED,
//! EXPIRED}`. All mutation of a request happens under that request's lock;
//! submissions for the same asset are serialized by an asset lock so an asset
//! never has two open requests. The asset registry is queried before any lock
//! is taken.
//!
//! Expiry is time-triggered. The sweep expires overdue requests, and any
//! foreground call that finds its request past the deadline expires it inline
//! before failing with `RequestClosed`.
//!
//! The last attestation row is written before the request itself. If that
//! second write fails the request is left PENDING with a full set of rows; the
//! sweep re-evaluates such requests before looking at their deadline.

use std::sync::Arc;
use std::time::Duration;

use acse_core::ranking::select;
use acse_core::{
    evaluate, score_spread, validate_evidence, verify_chain, AcseError, AcseResult, AssetId,
    Attestation, AttestorId, Caller, CategoryKey, Clock, ConsensusOutcome, DomainEvent,
    EvidenceRef, PartyId, RankingContext, RankingStrategy, RequestId, ReviewState, Role, Score,
    VerificationRecord, VerificationRequest, VerificationStatus,
};
use acse_store::EngineStorage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::collaborators::{guarded, RegistryClient, REGISTRY};
use crate::config::ConsensusConfig;
use crate::events::EventBus;
use crate::locks::EntityLocks;
use crate::policy::PolicyStore;
use crate::registry::AttestorRegistry;

/// Trust status of an asset as seen by the settlement gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetTrust {
    pub request_id: RequestId,
    pub asset_id: AssetId,
    pub status: VerificationStatus,
    pub category: CategoryKey,
    /// Valuation window of the category policy the request ran under
    pub buffer_period_secs: Option<u64>,
}

/// Read-only view of verification outcomes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrustGate: Send + Sync {
    /// Outcome of the most recent request for the asset, if any
    async fn asset_trust(&self, asset_id: &AssetId) -> AcseResult<Option<AssetTrust>>;
}

/// Result of one expiry sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Pending requests looked at
    pub examined: usize,
    /// Fully attested requests finalized by this sweep
    pub finalized: Vec<RequestId>,
    /// Requests moved to EXPIRED by this sweep
    pub expired: Vec<RequestId>,
    pub failed: usize,
}

/// What the sweep did to one pending request
enum Swept {
    Finalized,
    Expired,
    Untouched,
}

pub struct ConsensusEngine {
    storage: Arc<dyn EngineStorage>,
    registry: Arc<AttestorRegistry>,
    policies: Arc<PolicyStore>,
    assets: Arc<dyn RegistryClient>,
    ranking: Arc<dyn RankingStrategy>,
    config: ConsensusConfig,
    timeout: Duration,
    request_locks: EntityLocks<RequestId>,
    asset_locks: EntityLocks<AssetId>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl ConsensusEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn EngineStorage>,
        registry: Arc<AttestorRegistry>,
        policies: Arc<PolicyStore>,
        assets: Arc<dyn RegistryClient>,
        ranking: Arc<dyn RankingStrategy>,
        config: ConsensusConfig,
        timeout: Duration,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            registry,
            policies,
            assets,
            ranking,
            config,
            timeout,
            request_locks: EntityLocks::new(),
            asset_locks: EntityLocks::new(),
            events,
            clock,
        }
    }

    /// Open a verification request and assign attestors
    pub async fn submit(
        &self,
        asset_id: AssetId,
        evidence: Vec<EvidenceRef>,
        submitter: PartyId,
    ) -> AcseResult<VerificationRequest> {
        validate_evidence(&evidence)?;
        let asset = guarded(REGISTRY, self.timeout, self.assets.get_asset(&asset_id)).await?;
        let policy = self.policies.get_policy(&asset.category)?;

        let _asset_guard = self.asset_locks.lock(&asset_id).await;

        if let Some(latest) = self.storage.get_latest_request_for_asset(&asset_id).await? {
            if latest.status == VerificationStatus::Pending {
                let _request_guard = self.request_locks.lock(&latest.request_id).await;
                let mut latest = self.load(&latest.request_id).await?;
                let now = self.clock.now();
                if latest.status == VerificationStatus::Pending {
                    if !latest.is_past_deadline(now) {
                        return Err(AcseError::VerificationInProgress {
                            asset_id: asset_id.to_string(),
                            request_id: latest.request_id.to_string(),
                        });
                    }
                    self.expire_locked(&mut latest, now).await?;
                }
            }
        }

        let ctx = RankingContext {
            asset_id: asset_id.clone(),
            category: asset.category.clone(),
            submitter: submitter.clone(),
            jurisdiction: asset.jurisdiction.clone(),
        };
        let candidates = self.registry.list().await?;
        let required = policy.required_attestors;
        let selected = select(self.ranking.as_ref(), candidates, &ctx, required as usize);
        debug!(
            asset_id = %asset_id,
            strategy = self.ranking.name(),
            selected = ?selected,
            "Attestors ranked"
        );
        if selected.len() < required as usize {
            return Err(AcseError::InsufficientAttestors {
                required,
                available: selected.len() as u32,
            });
        }

        let now = self.clock.now();
        let request = VerificationRequest::open(
            asset_id,
            submitter,
            evidence,
            selected,
            (*policy).clone(),
            now,
        );
        self.storage.save_request(&request).await?;
        self.registry.reserve_assignments(&request.assigned).await?;

        info!(
            request_id = %request.request_id,
            asset_id = %request.asset_id,
            category = %request.category,
            policy_version = request.policy.version,
            deadline = %request.deadline,
            "Verification request opened"
        );
        self.events.publish(DomainEvent::VerificationSubmitted {
            request_id: request.request_id.clone(),
            asset_id: request.asset_id.clone(),
            assigned: request.assigned.clone(),
            deadline: request.deadline,
            at: now,
        });
        Ok(request)
    }

    /// Record one attestor's score and finalize when the request is fully attested
    pub async fn attest(
        &self,
        request_id: &RequestId,
        attestor_id: &AttestorId,
        score: u32,
        rationale: String,
    ) -> AcseResult<VerificationRecord> {
        let score = Score::new(score)?;

        let _guard = self.request_locks.lock(request_id).await;
        let mut request = self.load(request_id).await?;
        let now = self.clock.now();

        if request.status.is_terminal() {
            return Err(request.closed_error());
        }
        if request.is_past_deadline(now) {
            self.expire_locked(&mut request, now).await?;
            return Err(request.closed_error());
        }
        if !request.is_assigned(attestor_id) {
            return Err(AcseError::NotAssigned {
                request_id: request_id.to_string(),
                attestor_id: attestor_id.to_string(),
            });
        }

        let mut rows = self.storage.list_attestations(request_id).await?;
        if rows.iter().any(|r| &r.attestor_id == attestor_id) {
            return Err(already_attested(request_id, attestor_id));
        }

        let row = Attestation::append_to(
            rows.last(),
            request_id.clone(),
            attestor_id.clone(),
            score,
            rationale,
            now,
        );
        self.storage.append_attestation(&row).await.map_err(|e| {
            if e.is_duplicate() {
                already_attested(request_id, attestor_id)
            } else {
                e.into()
            }
        })?;
        info!(
            request_id = %request_id,
            attestor_id = %attestor_id,
            score = score.value(),
            sequence = row.sequence,
            "Attestation recorded"
        );
        self.events.publish(DomainEvent::AttestationRecorded {
            request_id: request_id.clone(),
            attestor_id: attestor_id.clone(),
            score,
            sequence: row.sequence,
            at: now,
        });
        rows.push(row);

        let record = VerificationRecord::project(&request, &rows)?;
        self.apply_outcome_locked(&mut request, &rows, record, now)
            .await
    }

    /// Manual-review decision for a fully attested, above-threshold request
    pub async fn review(
        &self,
        request_id: &RequestId,
        caller: &Caller,
        approve: bool,
        note: Option<String>,
    ) -> AcseResult<VerificationRecord> {
        caller.require(Role::Reviewer, "review_verification")?;

        let _guard = self.request_locks.lock(request_id).await;
        let mut request = self.load(request_id).await?;
        let now = self.clock.now();

        if request.status.is_terminal() {
            return Err(request.closed_error());
        }
        if request.is_past_deadline(now) {
            self.expire_locked(&mut request, now).await?;
            return Err(request.closed_error());
        }
        if !request.is_awaiting_review() {
            return Err(AcseError::ReviewNotPending {
                request_id: request_id.to_string(),
            });
        }

        let rows = self.storage.list_attestations(request_id).await?;
        let reviewer = caller.party.clone();
        let status = if approve {
            request.review = ReviewState::Approved {
                reviewer,
                at: now,
                note,
            };
            VerificationStatus::Verified
        } else {
            request.review = ReviewState::Declined {
                reviewer,
                at: now,
                note,
            };
            VerificationStatus::Rejected
        };
        info!(request_id = %request_id, reviewer = %caller.party, approve, "Manual review recorded");
        self.finalize_locked(&mut request, &rows, status, now).await
    }

    /// Expire every pending request past its deadline. Safe to run repeatedly
    /// and concurrently with foreground calls.
    pub async fn sweep_expired(&self) -> AcseResult<SweepReport> {
        let now = self.clock.now();
        let pending = self
            .storage
            .list_requests_by_status(VerificationStatus::Pending)
            .await?;

        let mut report = SweepReport {
            examined: pending.len(),
            ..SweepReport::default()
        };
        for candidate in pending {
            let request_id = candidate.request_id;
            let _guard = self.request_locks.lock(&request_id).await;
            match self.sweep_locked(&request_id, now).await {
                Ok(Swept::Finalized) => report.finalized.push(request_id),
                Ok(Swept::Expired) => report.expired.push(request_id),
                Ok(Swept::Untouched) => {}
                Err(e) => {
                    error!(request_id = %request_id, error = %e, "Failed to sweep request");
                    report.failed += 1;
                }
            }
        }
        if !report.expired.is_empty() || !report.finalized.is_empty() {
            info!(
                expired = report.expired.len(),
                finalized = report.finalized.len(),
                "Swept pending verification requests"
            );
        }
        Ok(report)
    }

    /// Projection of the attestation rows for a request
    pub async fn get_record(&self, request_id: &RequestId) -> AcseResult<VerificationRecord> {
        let request = self.load(request_id).await?;
        let rows = self.storage.list_attestations(request_id).await?;
        VerificationRecord::project(&request, &rows)
    }

    pub async fn get_request(&self, request_id: &RequestId) -> AcseResult<VerificationRequest> {
        self.load(request_id).await
    }

    /// Recompute the attestation hash chain; returns the number of rows checked
    pub async fn verify_ledger(&self, request_id: &RequestId) -> AcseResult<usize> {
        let request = self.load(request_id).await?;
        let rows = self.storage.list_attestations(request_id).await?;
        verify_chain(&rows)?;
        if let Some(stray) = rows.iter().find(|r| !request.is_assigned(&r.attestor_id)) {
            return Err(AcseError::invariant(
                "attestation ledger",
                format!("{} holds a row from unassigned {}", request_id, stray.attestor_id),
            ));
        }
        VerificationRecord::project(&request, &rows)?;
        Ok(rows.len())
    }

    pub fn prune_locks(&self) -> usize {
        self.request_locks.prune() + self.asset_locks.prune()
    }

    async fn load(&self, request_id: &RequestId) -> AcseResult<VerificationRequest> {
        self.storage
            .get_request(request_id)
            .await?
            .ok_or_else(|| AcseError::RequestNotFound {
                request_id: request_id.to_string(),
            })
    }

    /// Caller holds the request lock
    async fn sweep_locked(&self, request_id: &RequestId, now: DateTime<Utc>) -> AcseResult<Swept> {
        let mut request = self.load(request_id).await?;
        // lost the race to a foreground finalization
        if request.status.is_terminal() {
            return Ok(Swept::Untouched);
        }
        if let Some(record) = self.reconcile_locked(&mut request, now).await? {
            if record.status.is_terminal() {
                return Ok(Swept::Finalized);
            }
        }
        if request.is_past_deadline(now) && self.expire_locked(&mut request, now).await? {
            return Ok(Swept::Expired);
        }
        Ok(Swept::Untouched)
    }

    /// Act on the consensus outcome of a freshly projected record.
    /// Caller holds the request lock.
    async fn apply_outcome_locked(
        &self,
        request: &mut VerificationRequest,
        rows: &[Attestation],
        record: VerificationRecord,
        now: DateTime<Utc>,
    ) -> AcseResult<VerificationRecord> {
        match evaluate(&request.policy, &record) {
            ConsensusOutcome::Incomplete => Ok(record),
            ConsensusOutcome::AwaitingReview => {
                request.review = ReviewState::Awaiting { since: now };
                self.storage.save_request(request).await?;
                info!(
                    request_id = %request.request_id,
                    average_score = %record.average_score,
                    "Verification awaiting manual review"
                );
                self.events.publish(DomainEvent::VerificationAwaitingReview {
                    request_id: request.request_id.clone(),
                    average_score: record.average_score,
                    at: now,
                });
                VerificationRecord::project(request, rows)
            }
            ConsensusOutcome::Verified => {
                self.finalize_locked(request, rows, VerificationStatus::Verified, now)
                    .await
            }
            ConsensusOutcome::Rejected => {
                self.finalize_locked(request, rows, VerificationStatus::Rejected, now)
                    .await
            }
        }
    }

    /// Re-evaluate a PENDING request whose rows are all in but whose outcome
    /// was never saved. `None` when there is nothing to do.
    async fn reconcile_locked(
        &self,
        request: &mut VerificationRequest,
        now: DateTime<Utc>,
    ) -> AcseResult<Option<VerificationRecord>> {
        if request.is_awaiting_review() {
            return Ok(None);
        }
        let rows = self.storage.list_attestations(&request.request_id).await?;
        let record = VerificationRecord::project(request, &rows)?;
        if !record.is_complete() {
            return Ok(None);
        }
        warn!(
            request_id = %request.request_id,
            attestations = record.attestation_count,
            "Fully attested request still pending, re-evaluating"
        );
        self.apply_outcome_locked(request, &rows, record, now)
            .await
            .map(Some)
    }

    /// Commit a terminal VERIFIED/REJECTED outcome, then walk reputations.
    /// Caller holds the request lock.
    async fn finalize_locked(
        &self,
        request: &mut VerificationRequest,
        rows: &[Attestation],
        status: VerificationStatus,
        now: DateTime<Utc>,
    ) -> AcseResult<VerificationRecord> {
        request.finalize(status, now)?;
        self.storage.save_request(request).await?;

        let record = VerificationRecord::project(request, rows)?;
        let spread = score_spread(rows);
        let disagreement = spread > self.config.disagreement_margin;
        if disagreement {
            warn!(
                request_id = %request.request_id,
                spread,
                margin = self.config.disagreement_margin,
                "Attestors disagree beyond margin"
            );
        }
        info!(
            request_id = %request.request_id,
            asset_id = %request.asset_id,
            status = %status,
            average_score = %record.average_score,
            "Verification finalized"
        );

        self.walk_reputations(request, rows, record.average_score)
            .await;
        self.events.publish(DomainEvent::VerificationFinalized {
            request_id: request.request_id.clone(),
            asset_id: request.asset_id.clone(),
            status,
            average_score: record.average_score,
            attestation_count: record.attestation_count,
            disagreement,
            at: now,
        });
        Ok(record)
    }

    /// The finalization is already committed, so a failed step is logged, not returned
    async fn walk_reputations(
        &self,
        request: &VerificationRequest,
        rows: &[Attestation],
        average: Decimal,
    ) {
        for row in rows {
            if let Err(e) = self
                .registry
                .adjust_reputation(
                    &row.attestor_id,
                    &request.request_id,
                    row.score.value(),
                    average,
                    request.policy.deviation_tolerance,
                )
                .await
            {
                error!(
                    request_id = %request.request_id,
                    attestor_id = %row.attestor_id,
                    error = %e,
                    "Reputation adjustment failed"
                );
            }
        }
    }

    /// PENDING -> EXPIRED. Returns false if the request was already terminal.
    /// Caller holds the request lock.
    async fn expire_locked(
        &self,
        request: &mut VerificationRequest,
        now: DateTime<Utc>,
    ) -> AcseResult<bool> {
        if request.status.is_terminal() {
            return Ok(false);
        }
        let rows = self.storage.list_attestations(&request.request_id).await?;
        let record = VerificationRecord::project(request, &rows)?;
        request.finalize(VerificationStatus::Expired, now)?;
        self.storage.save_request(request).await?;

        for attestor_id in &request.assigned {
            if let Err(e) = self.registry.release_assignment(attestor_id).await {
                error!(
                    request_id = %request.request_id,
                    attestor_id = %attestor_id,
                    error = %e,
                    "Failed to release assignment"
                );
            }
        }

        info!(
            request_id = %request.request_id,
            asset_id = %request.asset_id,
            attestations = record.attestation_count,
            required = record.required_attestors,
            "Verification request expired"
        );
        self.events.publish(DomainEvent::VerificationFinalized {
            request_id: request.request_id.clone(),
            asset_id: request.asset_id.clone(),
            status: VerificationStatus::Expired,
            average_score: record.average_score,
            attestation_count: record.attestation_count,
            disagreement: false,
            at: now,
        });
        Ok(true)
    }
}

#[async_trait]
impl TrustGate for ConsensusEngine {
    async fn asset_trust(&self, asset_id: &AssetId) -> AcseResult<Option<AssetTrust>> {
        Ok(self
            .storage
            .get_latest_request_for_asset(asset_id)
            .await?
            .map(|r| AssetTrust {
                request_id: r.request_id,
                asset_id: r.asset_id,
                status: r.status,
                category: r.category,
                buffer_period_secs: r.policy.buffer_period_secs,
            }))
    }
}

fn already_attested(request_id: &RequestId, attestor_id: &AttestorId) -> AcseError {
    AcseError::AlreadyAttested {
        request_id: request_id.to_string(),
        attestor_id: attestor_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{AssetDescriptor, CollaboratorError, MockRegistryClient};
    use crate::config::AttestorConfig;
    use acse_core::{
        Attestor, AttestorRegistration, ErrorKind, ManualClock, Policy, PolicyParams,
        ReputationLoadRanking, Settlement, SettlementId, SettlementStatus,
    };
    use acse_store::{MemoryStorage, StorageStats, StoreError, StoreResult};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory storage whose next `save_request` can be made to fail
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        fail_request_save: AtomicBool,
    }

    impl FlakyStorage {
        fn fail_next_request_save(&self) {
            self.fail_request_save.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl EngineStorage for FlakyStorage {
        async fn save_attestor(&self, attestor: &Attestor) -> StoreResult<()> {
            self.inner.save_attestor(attestor).await
        }

        async fn get_attestor(&self, attestor_id: &AttestorId) -> StoreResult<Option<Attestor>> {
            self.inner.get_attestor(attestor_id).await
        }

        async fn get_attestor_by_identity(&self, identity: &str) -> StoreResult<Option<Attestor>> {
            self.inner.get_attestor_by_identity(identity).await
        }

        async fn list_attestors(&self) -> StoreResult<Vec<Attestor>> {
            self.inner.list_attestors().await
        }

        async fn append_policy(&self, policy: &Policy) -> StoreResult<()> {
            self.inner.append_policy(policy).await
        }

        async fn get_latest_policy(&self, category: &CategoryKey) -> StoreResult<Option<Policy>> {
            self.inner.get_latest_policy(category).await
        }

        async fn list_latest_policies(&self) -> StoreResult<Vec<Policy>> {
            self.inner.list_latest_policies().await
        }

        async fn get_policy_history(&self, category: &CategoryKey) -> StoreResult<Vec<Policy>> {
            self.inner.get_policy_history(category).await
        }

        async fn save_request(&self, request: &VerificationRequest) -> StoreResult<()> {
            if self.fail_request_save.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Database("disk full".to_string()));
            }
            self.inner.save_request(request).await
        }

        async fn get_request(&self, request_id: &RequestId) -> StoreResult<Option<VerificationRequest>> {
            self.inner.get_request(request_id).await
        }

        async fn list_requests_by_status(
            &self,
            status: VerificationStatus,
        ) -> StoreResult<Vec<VerificationRequest>> {
            self.inner.list_requests_by_status(status).await
        }

        async fn get_latest_request_for_asset(
            &self,
            asset_id: &AssetId,
        ) -> StoreResult<Option<VerificationRequest>> {
            self.inner.get_latest_request_for_asset(asset_id).await
        }

        async fn append_attestation(&self, attestation: &Attestation) -> StoreResult<()> {
            self.inner.append_attestation(attestation).await
        }

        async fn list_attestations(&self, request_id: &RequestId) -> StoreResult<Vec<Attestation>> {
            self.inner.list_attestations(request_id).await
        }

        async fn save_settlement(&self, settlement: &Settlement) -> StoreResult<()> {
            self.inner.save_settlement(settlement).await
        }

        async fn get_settlement(&self, settlement_id: &SettlementId) -> StoreResult<Option<Settlement>> {
            self.inner.get_settlement(settlement_id).await
        }

        async fn list_settlements_by_status(
            &self,
            status: SettlementStatus,
        ) -> StoreResult<Vec<Settlement>> {
            self.inner.list_settlements_by_status(status).await
        }

        async fn get_stats(&self) -> StoreResult<StorageStats> {
            self.inner.get_stats().await
        }
    }

    struct Fixture {
        engine: ConsensusEngine,
        registry: Arc<AttestorRegistry>,
        clock: Arc<ManualClock>,
    }

    async fn fixture(params: PolicyParams, attestors: &[&str]) -> Fixture {
        fixture_on(Arc::new(MemoryStorage::new()), params, attestors).await
    }

    async fn fixture_on(
        storage: Arc<dyn EngineStorage>,
        params: PolicyParams,
        attestors: &[&str],
    ) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let events = EventBus::new(64);
        let registry = Arc::new(AttestorRegistry::new(
            storage.clone(),
            AttestorConfig::default(),
            events.clone(),
            clock.clone(),
        ));
        let policies = Arc::new(PolicyStore::new(storage.clone(), events.clone(), clock.clone()));
        policies
            .set_policy(
                &Caller::from("gov").with_role(Role::Governance),
                CategoryKey::new("AGRICULTURAL"),
                params,
            )
            .await
            .unwrap();
        for identity in attestors {
            registry
                .register(AttestorRegistration::new(*identity, "Org", "KE", Decimal::new(5000, 0)))
                .await
                .unwrap();
        }

        let mut assets = MockRegistryClient::new();
        assets.expect_get_asset().returning(|id| {
            if id.as_str() == "asset:unknown" {
                return Err(CollaboratorError::AssetNotFound(id.clone()));
            }
            Ok(AssetDescriptor {
                asset_id: id.clone(),
                category: CategoryKey::new("AGRICULTURAL"),
                owner: PartyId::new("owner"),
                jurisdiction: Some("KE".to_string()),
            })
        });

        let engine = ConsensusEngine::new(
            storage,
            registry.clone(),
            policies,
            Arc::new(assets),
            Arc::new(ReputationLoadRanking),
            ConsensusConfig::default(),
            Duration::from_secs(1),
            events,
            clock.clone(),
        );
        Fixture {
            engine,
            registry,
            clock,
        }
    }

    fn evidence() -> Vec<EvidenceRef> {
        vec![EvidenceRef::new("doc://deed")]
    }

    async fn open(f: &Fixture, asset: &str) -> VerificationRequest {
        f.engine
            .submit(AssetId::new(asset), evidence(), PartyId::new("owner"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_validations() {
        let f = fixture(PolicyParams::new(7000, 2, 30), &["did:a"]).await;

        let err = f
            .engine
            .submit(AssetId::new("asset:1"), vec![], PartyId::new("owner"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEvidence);

        let err = f
            .engine
            .submit(AssetId::new("asset:unknown"), evidence(), PartyId::new("owner"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AssetNotFound);

        let err = f
            .engine
            .submit(AssetId::new("asset:1"), evidence(), PartyId::new("owner"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AcseError::InsufficientAttestors {
                required: 2,
                available: 1
            }
        );
    }

    #[tokio::test]
    async fn test_submitter_cannot_attest_own_asset() {
        let f = fixture(PolicyParams::new(7000, 2, 30), &["did:a", "owner"]).await;
        let err = f
            .engine
            .submit(AssetId::new("asset:1"), evidence(), PartyId::new("owner"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientAttestors);
    }

    #[tokio::test]
    async fn test_one_open_request_per_asset() {
        let f = fixture(PolicyParams::new(7000, 1, 30), &["did:a", "did:b"]).await;
        let first = open(&f, "asset:1").await;

        let err = f
            .engine
            .submit(AssetId::new("asset:1"), evidence(), PartyId::new("owner"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VerificationInProgress);

        // an overdue request is expired inline and replaced
        f.clock.advance(chrono::Duration::days(31));
        let second = open(&f, "asset:1").await;
        assert_ne!(first.request_id, second.request_id);
        let first = f.engine.get_request(&first.request_id).await.unwrap();
        assert_eq!(first.status, VerificationStatus::Expired);
    }

    #[tokio::test]
    async fn test_attest_guards() {
        let f = fixture(PolicyParams::new(7000, 2, 30), &["did:a", "did:b", "did:c"]).await;
        let req = open(&f, "asset:1").await;
        let assigned = req.assigned[0].clone();
        let outsider = f
            .registry
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.attestor_id)
            .find(|id| !req.is_assigned(id))
            .unwrap();

        let err = f
            .engine
            .attest(&req.request_id, &assigned, 10_001, "x".into())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScoreOutOfRange);

        let err = f
            .engine
            .attest(&req.request_id, &outsider, 8000, "x".into())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotAssigned);

        let record = f
            .engine
            .attest(&req.request_id, &assigned, 8000, "ok".into())
            .await
            .unwrap();
        assert_eq!(record.attestation_count, 1);
        assert_eq!(record.status, VerificationStatus::Pending);

        let err = f
            .engine
            .attest(&req.request_id, &assigned, 8000, "again".into())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyAttested);
    }

    #[tokio::test]
    async fn test_late_attestation_expires_inline() {
        let f = fixture(PolicyParams::new(7000, 2, 30), &["did:a", "did:b"]).await;
        let req = open(&f, "asset:1").await;
        f.engine
            .attest(&req.request_id, &req.assigned[0], 9000, "ok".into())
            .await
            .unwrap();

        f.clock.advance(chrono::Duration::days(30) + chrono::Duration::seconds(1));
        let err = f
            .engine
            .attest(&req.request_id, &req.assigned[1], 9000, "late".into())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AcseError::RequestClosed {
                request_id: req.request_id.to_string(),
                status: "EXPIRED".to_string()
            }
        );

        // the sweep finds nothing left to do
        let report = f.engine.sweep_expired().await.unwrap();
        assert!(report.expired.is_empty());
        assert_eq!(f.engine.get_record(&req.request_id).await.unwrap().attestation_count, 1);
    }

    #[tokio::test]
    async fn test_manual_review_flow() {
        let f = fixture(
            PolicyParams::new(7000, 2, 30).with_manual_review(true),
            &["did:a", "did:b"],
        )
        .await;
        let req = open(&f, "asset:1").await;
        let reviewer = Caller::from("rev").with_role(Role::Reviewer);

        let err = f
            .engine
            .review(&req.request_id, &reviewer, true, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReviewNotPending);

        for id in &req.assigned {
            f.engine
                .attest(&req.request_id, id, 8500, "ok".into())
                .await
                .unwrap();
        }
        let record = f.engine.get_record(&req.request_id).await.unwrap();
        assert_eq!(record.status, VerificationStatus::Pending);
        assert!(record.awaiting_review);

        let err = f
            .engine
            .review(&req.request_id, &Caller::from("nobody"), true, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        let record = f
            .engine
            .review(&req.request_id, &reviewer, true, Some("site visit ok".into()))
            .await
            .unwrap();
        assert_eq!(record.status, VerificationStatus::Verified);

        let trust = f
            .engine
            .asset_trust(&AssetId::new("asset:1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trust.status, VerificationStatus::Verified);
    }

    #[tokio::test]
    async fn test_ledger_verifies() {
        let f = fixture(PolicyParams::new(7000, 2, 30), &["did:a", "did:b"]).await;
        let req = open(&f, "asset:1").await;
        for id in &req.assigned {
            f.engine
                .attest(&req.request_id, id, 9000, "ok".into())
                .await
                .unwrap();
        }
        assert_eq!(f.engine.verify_ledger(&req.request_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sweep_releases_load() {
        let f = fixture(PolicyParams::new(7000, 2, 1), &["did:a", "did:b"]).await;
        let req = open(&f, "asset:1").await;
        for id in &req.assigned {
            assert_eq!(f.registry.get(id).await.unwrap().active_assignments, 1);
        }

        f.clock.advance(chrono::Duration::days(2));
        let first = f.engine.sweep_expired().await.unwrap();
        let second = f.engine.sweep_expired().await.unwrap();
        assert_eq!(first.expired, vec![req.request_id.clone()]);
        assert!(second.expired.is_empty());
        for id in &req.assigned {
            assert_eq!(f.registry.get(id).await.unwrap().active_assignments, 0);
        }
    }

    #[tokio::test]
    async fn test_sweep_finalizes_request_whose_save_failed() {
        let storage = Arc::new(FlakyStorage::default());
        let f = fixture_on(storage.clone(), PolicyParams::new(7000, 2, 30), &["did:a", "did:b"]).await;
        let req = open(&f, "asset:1").await;

        f.engine
            .attest(&req.request_id, &req.assigned[0], 8000, "ok".into())
            .await
            .unwrap();
        storage.fail_next_request_save();
        let err = f
            .engine
            .attest(&req.request_id, &req.assigned[1], 9000, "ok".into())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);

        // both rows landed, the outcome did not
        let stuck = f.engine.get_record(&req.request_id).await.unwrap();
        assert_eq!(stuck.status, VerificationStatus::Pending);
        assert!(stuck.is_complete());
        let retry = f
            .engine
            .attest(&req.request_id, &req.assigned[1], 9000, "ok".into())
            .await
            .unwrap_err();
        assert_eq!(retry.kind(), ErrorKind::AlreadyAttested);

        let report = f.engine.sweep_expired().await.unwrap();
        assert_eq!(report.finalized, vec![req.request_id.clone()]);
        assert!(report.expired.is_empty());

        let record = f.engine.get_record(&req.request_id).await.unwrap();
        assert_eq!(record.status, VerificationStatus::Verified);
        let trust = f
            .engine
            .asset_trust(&AssetId::new("asset:1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trust.status, VerificationStatus::Verified);

        let again = f.engine.sweep_expired().await.unwrap();
        assert!(again.finalized.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_leaves_partial_requests_pending() {
        let f = fixture(PolicyParams::new(7000, 2, 30), &["did:a", "did:b"]).await;
        let req = open(&f, "asset:1").await;
        f.engine
            .attest(&req.request_id, &req.assigned[0], 8000, "ok".into())
            .await
            .unwrap();

        let report = f.engine.sweep_expired().await.unwrap();
        assert_eq!(report.examined, 1);
        assert!(report.finalized.is_empty() && report.expired.is_empty());
        let record = f.engine.get_record(&req.request_id).await.unwrap();
        assert_eq!(record.status, VerificationStatus::Pending);
    }
}
