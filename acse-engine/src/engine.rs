//! Engine facade
//!
//! `EngineBuilder` wires storage, collaborators and the five components
//! together once at start-up; `AttestationEngine` is the single entry point
//! callers bind a transport to.

use std::sync::Arc;

use acse_core::{
    AcseError, AcseResult, Admission, AssetId, Attestor, AttestorId, AttestorRegistration,
    Caller, CategoryKey, Clock, DisputeResolution, DomainEvent, EvidenceRef, PartyId, Policy,
    PolicyParams, PriceSample, RankingStrategy, ReputationLoadRanking, RequestId, Settlement,
    SettlementDraft, SettlementId, SlashOutcome, SystemClock, Valuation, VerificationRecord,
    VerificationRequest,
};
use acse_store::{EngineStorage, MemoryStorage, SledStorage, StorageBackend, StorageStats};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::collaborators::{FundsRail, OracleClient, RegistryClient, FUNDS_RAIL, REGISTRY};
use crate::config::EngineConfig;
use crate::consensus::{ConsensusEngine, SweepReport, TrustGate};
use crate::events::EventBus;
use crate::policy::PolicyStore;
use crate::registry::AttestorRegistry;
use crate::settlement::{SettlementEngine, SettlementSweepReport};
use crate::sweeper::{SweepHandle, SweepRunner};
use crate::valuation::ValuationBuffer;

/// Builder for [`AttestationEngine`]
pub struct EngineBuilder {
    config: EngineConfig,
    storage: Option<Arc<dyn EngineStorage>>,
    assets: Option<Arc<dyn RegistryClient>>,
    oracle: Option<Arc<dyn OracleClient>>,
    rail: Option<Arc<dyn FundsRail>>,
    ranking: Option<Arc<dyn RankingStrategy>>,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            storage: None,
            assets: None,
            oracle: None,
            rail: None,
            ranking: None,
            clock: None,
        }
    }

    /// Use this storage instead of the backend named in the config
    pub fn with_storage(mut self, storage: Arc<dyn EngineStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_registry_client(mut self, assets: Arc<dyn RegistryClient>) -> Self {
        self.assets = Some(assets);
        self
    }

    /// Optional; without an oracle the buffer only sees ingested samples
    pub fn with_oracle(mut self, oracle: Arc<dyn OracleClient>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_funds_rail(mut self, rail: Arc<dyn FundsRail>) -> Self {
        self.rail = Some(rail);
        self
    }

    /// Defaults to [`ReputationLoadRanking`]
    pub fn with_ranking(mut self, ranking: Arc<dyn RankingStrategy>) -> Self {
        self.ranking = Some(ranking);
        self
    }

    /// Defaults to [`SystemClock`]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub async fn build(self) -> AcseResult<AttestationEngine> {
        self.config.validate()?;
        let assets = self.assets.ok_or_else(|| missing(REGISTRY))?;
        let rail = self.rail.ok_or_else(|| missing(FUNDS_RAIL))?;

        let storage: Arc<dyn EngineStorage> = match self.storage {
            Some(storage) => storage,
            None => match self.config.storage.backend {
                StorageBackend::Memory => Arc::new(MemoryStorage::new()),
                StorageBackend::Sled => Arc::new(SledStorage::new(&self.config.storage)?),
            },
        };
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ranking: Arc<dyn RankingStrategy> = self
            .ranking
            .unwrap_or_else(|| Arc::new(ReputationLoadRanking));
        let config = self.config;
        let timeout = config.collaborator_timeout();
        let events = EventBus::new(config.event_channel_capacity);

        let registry = Arc::new(AttestorRegistry::new(
            storage.clone(),
            config.attestor.clone(),
            events.clone(),
            clock.clone(),
        ));
        let policies = Arc::new(PolicyStore::new(
            storage.clone(),
            events.clone(),
            clock.clone(),
        ));
        policies.load().await?;

        let consensus = Arc::new(ConsensusEngine::new(
            storage.clone(),
            registry.clone(),
            policies.clone(),
            assets,
            ranking,
            config.consensus.clone(),
            timeout,
            events.clone(),
            clock.clone(),
        ));
        let valuation = Arc::new(ValuationBuffer::new(
            config.valuation.clone(),
            self.oracle,
            timeout,
            clock.clone(),
        ));
        let trust: Arc<dyn TrustGate> = consensus.clone();
        let settlements = SettlementEngine::new(
            storage.clone(),
            trust,
            valuation.clone(),
            rail,
            config.settlement.clone(),
            timeout,
            events.clone(),
            clock,
        );

        info!(
            backend = ?config.storage.backend,
            fee_bps = config.settlement.fee_bps,
            "Attestation engine ready"
        );
        Ok(AttestationEngine {
            config,
            storage,
            registry,
            policies,
            consensus,
            valuation,
            settlements,
            events,
        })
    }
}

fn missing(collaborator: &str) -> AcseError {
    AcseError::CollaboratorFailed {
        collaborator: collaborator.to_string(),
        reason: "not configured".to_string(),
    }
}

/// Both sweeps of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSweepReport {
    pub requests: SweepReport,
    pub settlements: SettlementSweepReport,
}

/// Attestation Consensus & Settlement Engine
pub struct AttestationEngine {
    config: EngineConfig,
    storage: Arc<dyn EngineStorage>,
    registry: Arc<AttestorRegistry>,
    policies: Arc<PolicyStore>,
    consensus: Arc<ConsensusEngine>,
    valuation: Arc<ValuationBuffer>,
    settlements: SettlementEngine,
    events: EventBus,
}

impl AttestationEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ==================== Attestors ====================

    pub async fn register_attestor(&self, registration: AttestorRegistration) -> AcseResult<AttestorId> {
        Ok(self.registry.register(registration).await?.attestor_id)
    }

    pub async fn slash_attestor(
        &self,
        attestor_id: &AttestorId,
        amount: Decimal,
        violation_ref: &str,
        reason: &str,
    ) -> AcseResult<SlashOutcome> {
        self.registry.slash(attestor_id, amount, violation_ref, reason).await
    }

    pub async fn add_stake(&self, attestor_id: &AttestorId, amount: Decimal) -> AcseResult<Attestor> {
        self.registry.add_stake(attestor_id, amount).await
    }

    pub async fn deactivate_attestor(&self, attestor_id: &AttestorId) -> AcseResult<Attestor> {
        self.registry.deactivate(attestor_id).await
    }

    pub async fn get_attestor(&self, attestor_id: &AttestorId) -> AcseResult<Attestor> {
        self.registry.get(attestor_id).await
    }

    pub async fn list_attestors(&self) -> AcseResult<Vec<Attestor>> {
        self.registry.list().await
    }

    // ==================== Policies ====================

    pub async fn set_policy(
        &self,
        caller: &Caller,
        category: CategoryKey,
        params: PolicyParams,
    ) -> AcseResult<Arc<Policy>> {
        self.policies.set_policy(caller, category, params).await
    }

    pub fn get_policy(&self, category: &CategoryKey) -> AcseResult<Arc<Policy>> {
        self.policies.get_policy(category)
    }

    pub async fn policy_history(&self, category: &CategoryKey) -> AcseResult<Vec<Policy>> {
        self.policies.history(category).await
    }

    // ==================== Verification ====================

    pub async fn submit_verification(
        &self,
        asset_id: AssetId,
        evidence: Vec<EvidenceRef>,
        submitter: PartyId,
    ) -> AcseResult<RequestId> {
        Ok(self
            .consensus
            .submit(asset_id, evidence, submitter)
            .await?
            .request_id)
    }

    pub async fn submit_attestation(
        &self,
        request_id: &RequestId,
        attestor_id: &AttestorId,
        score: u32,
        rationale: impl Into<String>,
    ) -> AcseResult<VerificationRecord> {
        self.consensus
            .attest(request_id, attestor_id, score, rationale.into())
            .await
    }

    pub async fn review_verification(
        &self,
        request_id: &RequestId,
        caller: &Caller,
        approve: bool,
        note: Option<String>,
    ) -> AcseResult<VerificationRecord> {
        self.consensus.review(request_id, caller, approve, note).await
    }

    pub async fn get_verification_record(&self, request_id: &RequestId) -> AcseResult<VerificationRecord> {
        self.consensus.get_record(request_id).await
    }

    pub async fn get_verification_request(
        &self,
        request_id: &RequestId,
    ) -> AcseResult<VerificationRequest> {
        self.consensus.get_request(request_id).await
    }

    pub async fn verify_ledger(&self, request_id: &RequestId) -> AcseResult<usize> {
        self.consensus.verify_ledger(request_id).await
    }

    // ==================== Valuation ====================

    pub fn ingest_price_sample(&self, sample: PriceSample) -> AcseResult<Admission> {
        self.valuation.ingest(sample)
    }

    pub async fn refresh_valuation(&self, asset_id: &AssetId) -> AcseResult<usize> {
        let period = self.buffer_period(asset_id).await?;
        self.valuation.refresh(asset_id, period).await
    }

    /// Valuation over the window of the asset's category policy
    pub async fn current_valuation(&self, asset_id: &AssetId) -> AcseResult<Valuation> {
        let period = self.buffer_period(asset_id).await?;
        Ok(self.valuation.current_valuation(asset_id, period))
    }

    async fn buffer_period(&self, asset_id: &AssetId) -> AcseResult<Option<u64>> {
        Ok(self
            .consensus
            .asset_trust(asset_id)
            .await?
            .and_then(|t| t.buffer_period_secs))
    }

    // ==================== Settlements ====================

    pub async fn create_settlement(&self, draft: SettlementDraft) -> AcseResult<SettlementId> {
        Ok(self.settlements.create(draft).await?.settlement_id)
    }

    pub async fn fund_settlement(&self, settlement_id: &SettlementId) -> AcseResult<Settlement> {
        self.settlements.fund(settlement_id).await
    }

    pub async fn confirm_settlement(&self, settlement_id: &SettlementId) -> AcseResult<Settlement> {
        self.settlements.confirm(settlement_id).await
    }

    pub async fn refund_settlement(
        &self,
        settlement_id: &SettlementId,
        requested_by: &PartyId,
    ) -> AcseResult<Settlement> {
        self.settlements.refund(settlement_id, requested_by).await
    }

    pub async fn dispute_settlement(
        &self,
        settlement_id: &SettlementId,
        raised_by: &PartyId,
        reason: &str,
    ) -> AcseResult<Settlement> {
        self.settlements.dispute(settlement_id, raised_by, reason).await
    }

    pub async fn resolve_dispute(
        &self,
        settlement_id: &SettlementId,
        caller: &Caller,
        resolution: DisputeResolution,
    ) -> AcseResult<Settlement> {
        self.settlements
            .resolve_dispute(settlement_id, caller, resolution)
            .await
    }

    pub async fn get_settlement(&self, settlement_id: &SettlementId) -> AcseResult<Settlement> {
        self.settlements.get(settlement_id).await
    }

    // ==================== Background ====================

    /// Run both expiry sweeps once
    pub async fn run_sweeps(&self) -> AcseResult<EngineSweepReport> {
        let requests = self.consensus.sweep_expired().await?;
        let settlements = self.settlements.sweep_expired().await?;
        Ok(EngineSweepReport {
            requests,
            settlements,
        })
    }

    /// Start the periodic sweep task
    pub fn start_sweeper(&self) -> SweepHandle {
        SweepRunner::new(
            self.consensus.clone(),
            self.settlements.clone(),
            self.registry.clone(),
            self.config.sweep_interval(),
        )
        .start()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    pub async fn stats(&self) -> AcseResult<StorageStats> {
        Ok(self.storage.get_stats().await?)
    }
}
