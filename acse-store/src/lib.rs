//! ACSE 存储层
//!
//! 提供验证引擎的持久化存储接口和实现。
//!
//! # 逻辑布局
//!
//! - 四张以追加为主的表：attestors、policies（每个版本一行）、
//!   verification requests、attestations（只追加，从不更新）
//! - 一张状态可变的表：settlements
//!
//! [`MemoryStorage`] 用于测试和开发，[`SledStorage`] 用于单节点持久化部署。
//!
//! 存储层不串行化写入者。读-改-写序列由调用方持有引擎的实体锁；
//! 存储层只保证重复的 (request, attestor) 证明行被原子拒绝。

pub mod error;
pub mod memory;
pub mod sled;

use acse_core::{
    AssetId, Attestation, Attestor, AttestorId, CategoryKey, Policy, RequestId, Settlement,
    SettlementId, SettlementStatus, VerificationRequest, VerificationStatus,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStorage;
pub use self::sled::SledStorage;

/// 引擎存储接口
///
/// 定义引擎所需的所有存储操作。
#[async_trait]
pub trait EngineStorage: Send + Sync {
    // ==================== Attestor 操作 ====================

    /// 插入或替换 attestor
    async fn save_attestor(&self, attestor: &Attestor) -> StoreResult<()>;

    async fn get_attestor(&self, attestor_id: &AttestorId) -> StoreResult<Option<Attestor>>;

    async fn get_attestor_by_identity(&self, identity: &str) -> StoreResult<Option<Attestor>>;

    async fn list_attestors(&self) -> StoreResult<Vec<Attestor>>;

    // ==================== Policy 操作 ====================

    /// 追加策略版本；版本已存在时返回 `Duplicate`
    async fn append_policy(&self, policy: &Policy) -> StoreResult<()>;

    async fn get_latest_policy(&self, category: &CategoryKey) -> StoreResult<Option<Policy>>;

    /// 每个类别的最新版本
    async fn list_latest_policies(&self) -> StoreResult<Vec<Policy>>;

    /// 类别的全部版本，按时间正序
    async fn get_policy_history(&self, category: &CategoryKey) -> StoreResult<Vec<Policy>>;

    // ==================== Request 操作 ====================

    async fn save_request(&self, request: &VerificationRequest) -> StoreResult<()>;

    async fn get_request(&self, request_id: &RequestId) -> StoreResult<Option<VerificationRequest>>;

    async fn list_requests_by_status(
        &self,
        status: VerificationStatus,
    ) -> StoreResult<Vec<VerificationRequest>>;

    /// 资产最近创建的请求
    async fn get_latest_request_for_asset(
        &self,
        asset_id: &AssetId,
    ) -> StoreResult<Option<VerificationRequest>>;

    // ==================== Attestation 操作 ====================

    /// 只追加；(request, attestor) 已存在时返回 `Duplicate`
    async fn append_attestation(&self, attestation: &Attestation) -> StoreResult<()>;

    /// 请求的证明行，按序号排序
    async fn list_attestations(&self, request_id: &RequestId) -> StoreResult<Vec<Attestation>>;

    // ==================== Settlement 操作 ====================

    async fn save_settlement(&self, settlement: &Settlement) -> StoreResult<()>;

    async fn get_settlement(&self, settlement_id: &SettlementId) -> StoreResult<Option<Settlement>>;

    async fn list_settlements_by_status(
        &self,
        status: SettlementStatus,
    ) -> StoreResult<Vec<Settlement>>;

    // ==================== 统计 ====================

    async fn get_stats(&self) -> StoreResult<StorageStats>;
}

/// 存储统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_attestors: u64,
    pub active_attestors: u64,
    /// 至少有一个策略版本的类别数
    pub policy_categories: u64,
    pub total_requests: u64,
    pub pending_requests: u64,
    pub total_attestations: u64,
    pub total_settlements: u64,
    /// CREATED、FUNDED 或 DISPUTED
    pub open_settlements: u64,
}

/// 存储后端选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sled,
}

/// 存储配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// 数据目录（仅 sled）
    pub data_dir: String,
    /// 页缓存大小，单位字节（仅 sled）
    pub cache_capacity: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_dir: "./acse_data".to_string(),
            cache_capacity: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl StorageConfig {
    /// 位于 `data_dir` 的 sled 持久化存储
    pub fn sled(data_dir: impl Into<String>) -> Self {
        Self {
            backend: StorageBackend::Sled,
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}

pub(crate) fn open_settlement(status: SettlementStatus) -> bool {
    matches!(
        status,
        SettlementStatus::Created | SettlementStatus::Funded | SettlementStatus::Disputed
    )
}
