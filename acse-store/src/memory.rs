//! 内存存储实现
//!
//! 提供基于内存的存储实现，主要用于测试和开发。

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{open_settlement, EngineStorage, StorageStats};
use crate::error::{StoreError, StoreResult};
use acse_core::{
    AssetId, Attestation, Attestor, AttestorId, CategoryKey, Policy, RequestId, Settlement,
    SettlementId, SettlementStatus, VerificationRequest, VerificationStatus,
};

/// 内存存储
///
/// 线程安全的内存存储实现，每张表一个 RwLock。
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    attestors: Arc<RwLock<HashMap<AttestorId, Attestor>>>,
    policies: Arc<RwLock<HashMap<CategoryKey, Vec<Policy>>>>,
    requests: Arc<RwLock<HashMap<RequestId, VerificationRequest>>>,
    attestations: Arc<RwLock<HashMap<RequestId, Vec<Attestation>>>>,
    settlements: Arc<RwLock<HashMap<SettlementId, Settlement>>>,
    // 索引
    identity_index: Arc<RwLock<HashMap<String, AttestorId>>>,
    asset_requests: Arc<RwLock<HashMap<AssetId, Vec<RequestId>>>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            attestors: Arc::new(RwLock::new(HashMap::new())),
            policies: Arc::new(RwLock::new(HashMap::new())),
            requests: Arc::new(RwLock::new(HashMap::new())),
            attestations: Arc::new(RwLock::new(HashMap::new())),
            settlements: Arc::new(RwLock::new(HashMap::new())),
            identity_index: Arc::new(RwLock::new(HashMap::new())),
            asset_requests: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 清空所有数据
    pub async fn clear(&self) {
        self.attestors.write().await.clear();
        self.policies.write().await.clear();
        self.requests.write().await.clear();
        self.attestations.write().await.clear();
        self.settlements.write().await.clear();
        self.identity_index.write().await.clear();
        self.asset_requests.write().await.clear();
    }
}

#[async_trait]
impl EngineStorage for MemoryStorage {
    // ==================== Attestor 操作 ====================

    async fn save_attestor(&self, attestor: &Attestor) -> StoreResult<()> {
        self.attestors
            .write()
            .await
            .insert(attestor.attestor_id.clone(), attestor.clone());
        self.identity_index
            .write()
            .await
            .insert(attestor.identity.clone(), attestor.attestor_id.clone());
        Ok(())
    }

    async fn get_attestor(&self, attestor_id: &AttestorId) -> StoreResult<Option<Attestor>> {
        Ok(self.attestors.read().await.get(attestor_id).cloned())
    }

    async fn get_attestor_by_identity(&self, identity: &str) -> StoreResult<Option<Attestor>> {
        let id = match self.identity_index.read().await.get(identity) {
            Some(id) => id.clone(),
            None => return Ok(None),
        };
        self.get_attestor(&id).await
    }

    async fn list_attestors(&self) -> StoreResult<Vec<Attestor>> {
        let mut all: Vec<Attestor> = self.attestors.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.attestor_id.cmp(&b.attestor_id));
        Ok(all)
    }

    // ==================== Policy 操作 ====================

    async fn append_policy(&self, policy: &Policy) -> StoreResult<()> {
        let mut policies = self.policies.write().await;
        let history = policies.entry(policy.category.clone()).or_default();
        if history.iter().any(|p| p.version == policy.version) {
            return Err(StoreError::duplicate(
                "policy",
                format!("{}@v{}", policy.category, policy.version),
            ));
        }
        history.push(policy.clone());
        history.sort_by_key(|p| p.version);
        Ok(())
    }

    async fn get_latest_policy(&self, category: &CategoryKey) -> StoreResult<Option<Policy>> {
        Ok(self
            .policies
            .read()
            .await
            .get(category)
            .and_then(|h| h.last().cloned()))
    }

    async fn list_latest_policies(&self) -> StoreResult<Vec<Policy>> {
        let mut latest: Vec<Policy> = self
            .policies
            .read()
            .await
            .values()
            .filter_map(|h| h.last().cloned())
            .collect();
        latest.sort_by(|a, b| a.category.cmp(&b.category));
        Ok(latest)
    }

    async fn get_policy_history(&self, category: &CategoryKey) -> StoreResult<Vec<Policy>> {
        Ok(self
            .policies
            .read()
            .await
            .get(category)
            .cloned()
            .unwrap_or_default())
    }

    // ==================== Request 操作 ====================

    async fn save_request(&self, request: &VerificationRequest) -> StoreResult<()> {
        let is_new = self
            .requests
            .write()
            .await
            .insert(request.request_id.clone(), request.clone())
            .is_none();
        if is_new {
            self.asset_requests
                .write()
                .await
                .entry(request.asset_id.clone())
                .or_default()
                .push(request.request_id.clone());
        }
        Ok(())
    }

    async fn get_request(&self, request_id: &RequestId) -> StoreResult<Option<VerificationRequest>> {
        Ok(self.requests.read().await.get(request_id).cloned())
    }

    async fn list_requests_by_status(
        &self,
        status: VerificationStatus,
    ) -> StoreResult<Vec<VerificationRequest>> {
        let mut matching: Vec<VerificationRequest> = self
            .requests
            .read()
            .await
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.created_at);
        Ok(matching)
    }

    async fn get_latest_request_for_asset(
        &self,
        asset_id: &AssetId,
    ) -> StoreResult<Option<VerificationRequest>> {
        let latest = match self
            .asset_requests
            .read()
            .await
            .get(asset_id)
            .and_then(|ids| ids.last().cloned())
        {
            Some(id) => id,
            None => return Ok(None),
        };
        self.get_request(&latest).await
    }

    // ==================== Attestation 操作 ====================

    async fn append_attestation(&self, attestation: &Attestation) -> StoreResult<()> {
        let mut attestations = self.attestations.write().await;
        let rows = attestations
            .entry(attestation.request_id.clone())
            .or_default();
        if rows.iter().any(|a| a.attestor_id == attestation.attestor_id) {
            return Err(StoreError::duplicate(
                "attestation",
                format!("{}/{}", attestation.request_id, attestation.attestor_id),
            ));
        }
        rows.push(attestation.clone());
        rows.sort_by_key(|a| a.sequence);
        Ok(())
    }

    async fn list_attestations(&self, request_id: &RequestId) -> StoreResult<Vec<Attestation>> {
        Ok(self
            .attestations
            .read()
            .await
            .get(request_id)
            .cloned()
            .unwrap_or_default())
    }

    // ==================== Settlement 操作 ====================

    async fn save_settlement(&self, settlement: &Settlement) -> StoreResult<()> {
        self.settlements
            .write()
            .await
            .insert(settlement.settlement_id.clone(), settlement.clone());
        Ok(())
    }

    async fn get_settlement(&self, settlement_id: &SettlementId) -> StoreResult<Option<Settlement>> {
        Ok(self.settlements.read().await.get(settlement_id).cloned())
    }

    async fn list_settlements_by_status(
        &self,
        status: SettlementStatus,
    ) -> StoreResult<Vec<Settlement>> {
        let mut matching: Vec<Settlement> = self
            .settlements
            .read()
            .await
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.created_at);
        Ok(matching)
    }

    // ==================== 统计 ====================

    async fn get_stats(&self) -> StoreResult<StorageStats> {
        let mut stats = StorageStats::default();

        for attestor in self.attestors.read().await.values() {
            stats.total_attestors += 1;
            if attestor.active {
                stats.active_attestors += 1;
            }
        }
        stats.policy_categories = self.policies.read().await.len() as u64;
        for request in self.requests.read().await.values() {
            stats.total_requests += 1;
            if request.status == VerificationStatus::Pending {
                stats.pending_requests += 1;
            }
        }
        stats.total_attestations = self
            .attestations
            .read()
            .await
            .values()
            .map(|rows| rows.len() as u64)
            .sum();
        for settlement in self.settlements.read().await.values() {
            stats.total_settlements += 1;
            if open_settlement(settlement.status) {
                stats.open_settlements += 1;
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acse_core::{
        AttestorId, EvidenceRef, PartyId, PolicyParams, Score,
    };
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn policy(version: u32) -> Policy {
        Policy::from_params(
            CategoryKey::new("AGRICULTURAL"),
            &PolicyParams::new(7000, 2, 30),
            version,
            Utc::now(),
        )
        .unwrap()
    }

    fn request(asset: &str) -> VerificationRequest {
        VerificationRequest::open(
            AssetId::new(asset),
            PartyId::new("owner"),
            vec![EvidenceRef::new("doc://deed")],
            vec![AttestorId::new("att:a"), AttestorId::new("att:b")],
            policy(1),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_attestor_identity_index() {
        let store = MemoryStorage::new();
        let attestor = Attestor::new("did:x", "Org", "KE", Decimal::new(5000, 0), 5000, Utc::now());
        store.save_attestor(&attestor).await.unwrap();

        let found = store.get_attestor_by_identity("did:x").await.unwrap().unwrap();
        assert_eq!(found.attestor_id, attestor.attestor_id);
        assert!(store.get_attestor_by_identity("did:y").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_policy_versions() {
        let store = MemoryStorage::new();
        store.append_policy(&policy(1)).await.unwrap();
        store.append_policy(&policy(2)).await.unwrap();
        assert!(store.append_policy(&policy(2)).await.unwrap_err().is_duplicate());

        let cat = CategoryKey::new("AGRICULTURAL");
        assert_eq!(store.get_latest_policy(&cat).await.unwrap().unwrap().version, 2);
        assert_eq!(store.get_policy_history(&cat).await.unwrap().len(), 2);
        assert_eq!(store.list_latest_policies().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_attestation_pair_is_unique() {
        let store = MemoryStorage::new();
        let req = request("asset:1");
        store.save_request(&req).await.unwrap();

        let first = Attestation::append_to(
            None,
            req.request_id.clone(),
            AttestorId::new("att:a"),
            Score::new(8000).unwrap(),
            "ok",
            Utc::now(),
        );
        store.append_attestation(&first).await.unwrap();
        let again = Attestation::append_to(
            Some(&first),
            req.request_id.clone(),
            AttestorId::new("att:a"),
            Score::new(1000).unwrap(),
            "changed my mind",
            Utc::now(),
        );
        assert!(store.append_attestation(&again).await.unwrap_err().is_duplicate());
        assert_eq!(store.list_attestations(&req.request_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_latest_request_for_asset() {
        let store = MemoryStorage::new();
        let first = request("asset:1");
        let second = request("asset:1");
        store.save_request(&first).await.unwrap();
        store.save_request(&second).await.unwrap();
        // 重新保存第一个请求不得改变其顺序
        store.save_request(&first).await.unwrap();

        let latest = store
            .get_latest_request_for_asset(&AssetId::new("asset:1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.request_id, second.request_id);

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.pending_requests, 2);
    }
}
