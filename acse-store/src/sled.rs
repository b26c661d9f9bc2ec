//! Sled 持久化存储实现
//!
//! 提供基于 Sled 嵌入式数据库的单节点持久化存储实现。
//! 行以 serde_json 编码，二级索引存放在各自的 tree 中。

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::{open_settlement, EngineStorage, StorageConfig, StorageStats};
use crate::error::{StoreError, StoreResult};
use acse_core::{
    AssetId, Attestation, Attestor, AttestorId, CategoryKey, Policy, RequestId, Settlement,
    SettlementId, SettlementStatus, VerificationRequest, VerificationStatus,
};

/// Tree 名称常量
const ATTESTORS_TREE: &str = "attestors";
const POLICIES_TREE: &str = "policies";
const REQUESTS_TREE: &str = "requests";
const ATTESTATIONS_TREE: &str = "attestations";
const SETTLEMENTS_TREE: &str = "settlements";
const IDENTITY_INDEX_TREE: &str = "identity_index";
const ASSET_REQUESTS_TREE: &str = "asset_requests";
const ATTESTATION_PAIRS_TREE: &str = "attestation_pairs";

/// Sled 存储
#[derive(Debug, Clone)]
pub struct SledStorage {
    db: sled::Db,
    attestors: sled::Tree,
    policies: sled::Tree,
    requests: sled::Tree,
    attestations: sled::Tree,
    settlements: sled::Tree,
    identity_index: sled::Tree,
    asset_requests: sled::Tree,
    attestation_pairs: sled::Tree,
}

impl SledStorage {
    /// 使用配置打开
    pub fn new(config: &StorageConfig) -> StoreResult<Self> {
        let db = sled::Config::new()
            .path(&config.data_dir)
            .cache_capacity(config.cache_capacity)
            .open()
            .map_err(|e| StoreError::Database(format!("Failed to open sled db: {}", e)))?;
        Self::from_db(db)
    }

    /// 在 `path` 打开或创建数据库
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)
            .map_err(|e| StoreError::Database(format!("Failed to open sled db: {}", e)))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> StoreResult<Self> {
        let tree = |name: &str| {
            db.open_tree(name)
                .map_err(|e| StoreError::Database(format!("Failed to open {} tree: {}", name, e)))
        };
        Ok(Self {
            attestors: tree(ATTESTORS_TREE)?,
            policies: tree(POLICIES_TREE)?,
            requests: tree(REQUESTS_TREE)?,
            attestations: tree(ATTESTATIONS_TREE)?,
            settlements: tree(SETTLEMENTS_TREE)?,
            identity_index: tree(IDENTITY_INDEX_TREE)?,
            asset_requests: tree(ASSET_REQUESTS_TREE)?,
            attestation_pairs: tree(ATTESTATION_PAIRS_TREE)?,
            db,
        })
    }

    /// 刷新到磁盘
    pub fn flush(&self) -> StoreResult<()> {
        self.db
            .flush()
            .map_err(|e| StoreError::Database(format!("Failed to flush db: {}", e)))?;
        Ok(())
    }

    // ==================== 辅助方法 ====================

    fn serialize<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get_row<T: DeserializeOwned>(tree: &sled::Tree, key: &[u8]) -> StoreResult<Option<T>> {
        match tree.get(key)? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(tree: &sled::Tree) -> StoreResult<Vec<T>> {
        let mut rows = Vec::new();
        for item in tree.iter() {
            let (_, value) = item?;
            rows.push(Self::deserialize(&value)?);
        }
        Ok(rows)
    }

    /// `<prefix>\0<大端 u32>` 保证版本和序号有序
    fn ordered_key(prefix: &str, n: u32) -> Vec<u8> {
        let mut key = Self::prefix_key(prefix);
        key.extend_from_slice(&n.to_be_bytes());
        key
    }

    fn prefix_key(prefix: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(prefix.len() + 5);
        key.extend_from_slice(prefix.as_bytes());
        key.push(0);
        key
    }

    fn pair_key(request_id: &RequestId, attestor_id: &AttestorId) -> Vec<u8> {
        let mut key = Self::prefix_key(request_id.as_str());
        key.extend_from_slice(attestor_id.as_str().as_bytes());
        key
    }
}

#[async_trait]
impl EngineStorage for SledStorage {
    // ==================== Attestor 操作 ====================

    async fn save_attestor(&self, attestor: &Attestor) -> StoreResult<()> {
        let key = attestor.attestor_id.as_str().as_bytes();
        self.attestors.insert(key, Self::serialize(attestor)?)?;
        self.identity_index
            .insert(attestor.identity.as_bytes(), key)?;
        Ok(())
    }

    async fn get_attestor(&self, attestor_id: &AttestorId) -> StoreResult<Option<Attestor>> {
        Self::get_row(&self.attestors, attestor_id.as_str().as_bytes())
    }

    async fn get_attestor_by_identity(&self, identity: &str) -> StoreResult<Option<Attestor>> {
        match self.identity_index.get(identity.as_bytes())? {
            Some(id) => Self::get_row(&self.attestors, &id),
            None => Ok(None),
        }
    }

    async fn list_attestors(&self) -> StoreResult<Vec<Attestor>> {
        Self::scan(&self.attestors)
    }

    // ==================== Policy 操作 ====================

    async fn append_policy(&self, policy: &Policy) -> StoreResult<()> {
        let key = Self::ordered_key(policy.category.as_str(), policy.version);
        let value = Self::serialize(policy)?;
        match self
            .policies
            .compare_and_swap(key, None::<&[u8]>, Some(value))?
        {
            Ok(()) => Ok(()),
            Err(_) => Err(StoreError::duplicate(
                "policy",
                format!("{}@v{}", policy.category, policy.version),
            )),
        }
    }

    async fn get_latest_policy(&self, category: &CategoryKey) -> StoreResult<Option<Policy>> {
        match self
            .policies
            .scan_prefix(Self::prefix_key(category.as_str()))
            .next_back()
        {
            Some(item) => {
                let (_, value) = item?;
                Ok(Some(Self::deserialize(&value)?))
            }
            None => Ok(None),
        }
    }

    async fn list_latest_policies(&self) -> StoreResult<Vec<Policy>> {
        let mut latest: BTreeMap<CategoryKey, Policy> = BTreeMap::new();
        for policy in Self::scan::<Policy>(&self.policies)? {
            // 同一类别内的键按版本排序
            latest.insert(policy.category.clone(), policy);
        }
        Ok(latest.into_values().collect())
    }

    async fn get_policy_history(&self, category: &CategoryKey) -> StoreResult<Vec<Policy>> {
        let mut history = Vec::new();
        for item in self.policies.scan_prefix(Self::prefix_key(category.as_str())) {
            let (_, value) = item?;
            history.push(Self::deserialize(&value)?);
        }
        Ok(history)
    }

    // ==================== Request 操作 ====================

    async fn save_request(&self, request: &VerificationRequest) -> StoreResult<()> {
        let key = request.request_id.as_str().as_bytes();
        let previous = self.requests.insert(key, Self::serialize(request)?)?;
        if previous.is_none() {
            let index_key = request.asset_id.as_str().as_bytes();
            let mut ids: Vec<RequestId> =
                Self::get_row(&self.asset_requests, index_key)?.unwrap_or_default();
            ids.push(request.request_id.clone());
            self.asset_requests
                .insert(index_key, Self::serialize(&ids)?)?;
        }
        Ok(())
    }

    async fn get_request(&self, request_id: &RequestId) -> StoreResult<Option<VerificationRequest>> {
        Self::get_row(&self.requests, request_id.as_str().as_bytes())
    }

    async fn list_requests_by_status(
        &self,
        status: VerificationStatus,
    ) -> StoreResult<Vec<VerificationRequest>> {
        let mut matching: Vec<VerificationRequest> = Self::scan::<VerificationRequest>(&self.requests)?
            .into_iter()
            .filter(|r| r.status == status)
            .collect();
        matching.sort_by_key(|r| r.created_at);
        Ok(matching)
    }

    async fn get_latest_request_for_asset(
        &self,
        asset_id: &AssetId,
    ) -> StoreResult<Option<VerificationRequest>> {
        let ids: Vec<RequestId> =
            Self::get_row(&self.asset_requests, asset_id.as_str().as_bytes())?.unwrap_or_default();
        match ids.last() {
            Some(id) => self.get_request(id).await,
            None => Ok(None),
        }
    }

    // ==================== Attestation 操作 ====================

    async fn append_attestation(&self, attestation: &Attestation) -> StoreResult<()> {
        let row_key = Self::ordered_key(attestation.request_id.as_str(), attestation.sequence);
        let pair_key = Self::pair_key(&attestation.request_id, &attestation.attestor_id);

        // 先占用 pair 索引，重复行不会进入账本
        let claimed = self
            .attestation_pairs
            .compare_and_swap(pair_key, None::<&[u8]>, Some(row_key.clone()))?;
        if claimed.is_err() {
            return Err(StoreError::duplicate(
                "attestation",
                format!("{}/{}", attestation.request_id, attestation.attestor_id),
            ));
        }
        let value = Self::serialize(attestation)?;
        match self
            .attestations
            .compare_and_swap(row_key, None::<&[u8]>, Some(value))?
        {
            Ok(()) => Ok(()),
            Err(_) => Err(StoreError::duplicate(
                "attestation",
                format!("{}#{}", attestation.request_id, attestation.sequence),
            )),
        }
    }

    async fn list_attestations(&self, request_id: &RequestId) -> StoreResult<Vec<Attestation>> {
        let mut rows = Vec::new();
        for item in self.attestations.scan_prefix(Self::prefix_key(request_id.as_str())) {
            let (_, value) = item?;
            rows.push(Self::deserialize(&value)?);
        }
        Ok(rows)
    }

    // ==================== Settlement 操作 ====================

    async fn save_settlement(&self, settlement: &Settlement) -> StoreResult<()> {
        self.settlements.insert(
            settlement.settlement_id.as_str().as_bytes(),
            Self::serialize(settlement)?,
        )?;
        Ok(())
    }

    async fn get_settlement(&self, settlement_id: &SettlementId) -> StoreResult<Option<Settlement>> {
        Self::get_row(&self.settlements, settlement_id.as_str().as_bytes())
    }

    async fn list_settlements_by_status(
        &self,
        status: SettlementStatus,
    ) -> StoreResult<Vec<Settlement>> {
        let mut matching: Vec<Settlement> = Self::scan::<Settlement>(&self.settlements)?
            .into_iter()
            .filter(|s| s.status == status)
            .collect();
        matching.sort_by_key(|s| s.created_at);
        Ok(matching)
    }

    // ==================== 统计 ====================

    async fn get_stats(&self) -> StoreResult<StorageStats> {
        let mut stats = StorageStats::default();

        for attestor in Self::scan::<Attestor>(&self.attestors)? {
            stats.total_attestors += 1;
            if attestor.active {
                stats.active_attestors += 1;
            }
        }
        stats.policy_categories = self.list_latest_policies().await?.len() as u64;
        for request in Self::scan::<VerificationRequest>(&self.requests)? {
            stats.total_requests += 1;
            if request.status == VerificationStatus::Pending {
                stats.pending_requests += 1;
            }
        }
        stats.total_attestations = self.attestations.len() as u64;
        for settlement in Self::scan::<Settlement>(&self.settlements)? {
            stats.total_settlements += 1;
            if open_settlement(settlement.status) {
                stats.open_settlements += 1;
            }
        }

        Ok(stats)
    }
}
