//! Shared fixtures: in-process collaborators and an engine wired to them.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use acse_core::{
    AssetId, AttestorId, AttestorRegistration, Caller, CategoryKey, Clock, EvidenceRef,
    ManualClock, PartyId, PolicyParams, PriceSample, RequestId, Role, SettlementDraft,
    SettlementId, TransferKind,
};
use acse_engine::{
    AssetDescriptor, AttestationEngine, CollaboratorError, EngineConfig, FundsRail,
    OracleClient, RegistryClient, TransferReceipt,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;

pub const AGRICULTURAL: &str = "AGRICULTURAL";
pub const ESCROW: &str = "acse-escrow";

// ==================== Asset registry ====================

#[derive(Default)]
pub struct FakeRegistry {
    assets: DashMap<AssetId, AssetDescriptor>,
}

impl FakeRegistry {
    pub fn add(&self, asset_id: &str, category: &str) -> AssetId {
        let asset_id = AssetId::new(asset_id);
        self.assets.insert(
            asset_id.clone(),
            AssetDescriptor {
                asset_id: asset_id.clone(),
                category: CategoryKey::new(category),
                owner: PartyId::new("party:owner"),
                jurisdiction: None,
            },
        );
        asset_id
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn get_asset(&self, asset_id: &AssetId) -> Result<AssetDescriptor, CollaboratorError> {
        self.assets
            .get(asset_id)
            .map(|a| a.value().clone())
            .ok_or_else(|| CollaboratorError::AssetNotFound(asset_id.clone()))
    }
}

// ==================== Oracle ====================

#[derive(Default)]
pub struct FakeOracle {
    feeds: DashMap<AssetId, Vec<PriceSample>>,
}

impl FakeOracle {
    pub fn publish(&self, sample: PriceSample) {
        self.feeds
            .entry(sample.asset_id.clone())
            .or_default()
            .push(sample);
    }
}

#[async_trait]
impl OracleClient for FakeOracle {
    async fn latest_samples(
        &self,
        asset_id: &AssetId,
        since: DateTime<Utc>,
    ) -> Result<Vec<PriceSample>, CollaboratorError> {
        Ok(self
            .feeds
            .get(asset_id)
            .map(|f| f.iter().filter(|s| s.observed_at > since).cloned().collect())
            .unwrap_or_default())
    }
}

// ==================== Funds rail ====================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transfer {
    pub kind: TransferKind,
    pub from: PartyId,
    pub to: PartyId,
    pub amount: Decimal,
    pub reference: String,
}

/// Records every transfer; `fail` makes calls error without recording
#[derive(Default)]
pub struct FakeRail {
    ledger: Mutex<Vec<Transfer>>,
    fail: AtomicBool,
    calls: AtomicU32,
}

impl FakeRail {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.ledger.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Transfers whose reference names this settlement
    pub fn transfers_for(&self, settlement_id: &SettlementId) -> Vec<Transfer> {
        let prefix = format!("{}:", settlement_id);
        self.transfers()
            .into_iter()
            .filter(|t| t.reference.starts_with(&prefix))
            .collect()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Net amount received by `party` across all recorded transfers
    pub fn balance(&self, party: &str) -> Decimal {
        self.transfers().iter().fold(Decimal::ZERO, |acc, t| {
            if t.to.as_str() == party {
                acc + t.amount
            } else if t.from.as_str() == party {
                acc - t.amount
            } else {
                acc
            }
        })
    }

    fn record(
        &self,
        kind: TransferKind,
        from: &PartyId,
        to: &PartyId,
        amount: Decimal,
        reference: &str,
    ) -> Result<TransferReceipt, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("rail offline".to_string()));
        }
        let mut ledger = self
            .ledger
            .lock()
            .map_err(|_| CollaboratorError::Unavailable("ledger poisoned".to_string()))?;
        ledger.push(Transfer {
            kind,
            from: from.clone(),
            to: to.clone(),
            amount,
            reference: reference.to_string(),
        });
        Ok(TransferReceipt {
            reference: format!("rail:{}", ledger.len()),
            amount,
        })
    }
}

#[async_trait]
impl FundsRail for FakeRail {
    async fn hold(
        &self,
        from: &PartyId,
        to: &PartyId,
        amount: Decimal,
        reference: &str,
    ) -> Result<TransferReceipt, CollaboratorError> {
        self.record(TransferKind::Hold, from, to, amount, reference)
    }

    async fn release(
        &self,
        from: &PartyId,
        to: &PartyId,
        amount: Decimal,
        reference: &str,
    ) -> Result<TransferReceipt, CollaboratorError> {
        self.record(TransferKind::Release, from, to, amount, reference)
    }

    async fn refund(
        &self,
        from: &PartyId,
        to: &PartyId,
        amount: Decimal,
        reference: &str,
    ) -> Result<TransferReceipt, CollaboratorError> {
        self.record(TransferKind::Refund, from, to, amount, reference)
    }
}

// ==================== Harness ====================

pub struct Harness {
    pub engine: AttestationEngine,
    pub clock: Arc<ManualClock>,
    pub registry: Arc<FakeRegistry>,
    pub oracle: Arc<FakeOracle>,
    pub rail: Arc<FakeRail>,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub async fn harness() -> Harness {
    harness_with(EngineConfig::default(), false).await
}

/// `with_oracle` wires the fake oracle in; otherwise prices come only from `ingest`
pub async fn harness_with(config: EngineConfig, with_oracle: bool) -> Harness {
    let clock = Arc::new(ManualClock::new(start_time()));
    let registry = Arc::new(FakeRegistry::default());
    let oracle = Arc::new(FakeOracle::default());
    let rail = Arc::new(FakeRail::default());

    let mut builder = AttestationEngine::builder(config)
        .with_registry_client(registry.clone())
        .with_funds_rail(rail.clone())
        .with_clock(clock.clone());
    if with_oracle {
        builder = builder.with_oracle(oracle.clone());
    }
    let engine = builder.build().await.unwrap();

    Harness {
        engine,
        clock,
        registry,
        oracle,
        rail,
    }
}

pub fn governance() -> Caller {
    Caller::new("party:governance").with_role(Role::Governance)
}

pub fn reviewer() -> Caller {
    Caller::new("party:reviewer").with_role(Role::Reviewer)
}

pub fn arbiter() -> Caller {
    Caller::new("party:arbiter").with_role(Role::Arbiter)
}

pub fn evidence() -> Vec<EvidenceRef> {
    vec![EvidenceRef::new("ipfs://survey-report")]
}

impl Harness {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// minScore 7000, 2 attestors, 30 days
    pub async fn agricultural_policy(&self) {
        self.engine
            .set_policy(
                &governance(),
                CategoryKey::new(AGRICULTURAL),
                PolicyParams::new(7_000, 2, 30),
            )
            .await
            .unwrap();
    }

    pub async fn set_policy(&self, params: PolicyParams) {
        self.engine
            .set_policy(&governance(), CategoryKey::new(AGRICULTURAL), params)
            .await
            .unwrap();
    }

    pub async fn register(&self, identity: &str) -> AttestorId {
        self.register_with_stake(identity, Decimal::new(5_000, 0)).await
    }

    pub async fn register_with_stake(&self, identity: &str, stake: Decimal) -> AttestorId {
        self.engine
            .register_attestor(AttestorRegistration::new(identity, "Acme Surveyors", "KE", stake))
            .await
            .unwrap()
    }

    /// Submit a request for a fresh agricultural asset
    pub async fn submit(&self, asset: &str) -> (AssetId, RequestId) {
        let asset_id = self.registry.add(asset, AGRICULTURAL);
        let request_id = self
            .engine
            .submit_verification(asset_id.clone(), evidence(), PartyId::new("party:submitter"))
            .await
            .unwrap();
        (asset_id, request_id)
    }

    pub async fn assigned(&self, request_id: &RequestId) -> Vec<AttestorId> {
        self.engine
            .get_verification_request(request_id)
            .await
            .unwrap()
            .assigned
    }

    /// Attest every assigned attestor with the given scores, in order
    pub async fn attest_all(&self, request_id: &RequestId, scores: &[u32]) {
        let assigned = self.assigned(request_id).await;
        assert_eq!(assigned.len(), scores.len());
        for (attestor_id, score) in assigned.iter().zip(scores) {
            self.engine
                .submit_attestation(request_id, attestor_id, *score, "site visit")
                .await
                .unwrap();
        }
    }

    /// A VERIFIED agricultural asset with two attestors behind it
    pub async fn verified_asset(&self, asset: &str) -> AssetId {
        let (asset_id, request_id) = self.submit(asset).await;
        self.attest_all(&request_id, &[8_000, 9_000]).await;
        asset_id
    }

    /// Five samples one minute apart ending now, within 1% of 100
    pub fn ingest_fresh_prices(&self, asset_id: &AssetId) {
        let prices = [100, 101, 99, 100, 100];
        for (i, price) in prices.iter().enumerate() {
            let at = self.now() - Duration::minutes(4 - i as i64);
            self.engine
                .ingest_price_sample(PriceSample::new(asset_id.clone(), Decimal::new(*price, 0), at))
                .unwrap();
        }
    }

    pub fn draft(&self, asset_id: &AssetId, amount: i64) -> SettlementDraft {
        SettlementDraft::new(
            asset_id.clone(),
            PartyId::new("party:buyer"),
            PartyId::new("party:seller"),
            Decimal::new(amount, 0),
            self.now() + Duration::days(30),
        )
    }

    /// CREATED -> FUNDED settlement of 10000 on a verified asset
    pub async fn funded_settlement(&self, asset: &str) -> (AssetId, SettlementId) {
        let asset_id = self.verified_asset(asset).await;
        let settlement_id = self
            .engine
            .create_settlement(self.draft(&asset_id, 10_000))
            .await
            .unwrap();
        self.engine.fund_settlement(&settlement_id).await.unwrap();
        (asset_id, settlement_id)
    }
}
