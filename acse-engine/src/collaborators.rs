//! External collaborators
//!
//! The engine consumes three black boxes: the asset registry, the valuation
//! oracle and the funds rail. Every call goes through [`guarded`], which applies
//! the configured timeout and maps failures onto engine error kinds. Nothing
//! here retries.

use acse_core::{AcseError, AcseResult, AssetId, CategoryKey, PartyId, PriceSample};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub const REGISTRY: &str = "asset_registry";
pub const ORACLE: &str = "valuation_oracle";
pub const FUNDS_RAIL: &str = "funds_rail";

/// Failure reported by a collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    /// Registry does not know the asset
    #[error("asset {0} not found")]
    AssetNotFound(AssetId),
    /// Call reached the collaborator and was refused
    #[error("rejected: {0}")]
    Rejected(String),
    /// Collaborator unreachable or failing
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Immutable asset descriptor from the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub asset_id: AssetId,
    pub category: CategoryKey,
    pub owner: PartyId,
    pub jurisdiction: Option<String>,
}

/// Acknowledgement of a funds movement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    /// Rail-side reference
    pub reference: String,
    pub amount: Decimal,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn get_asset(&self, asset_id: &AssetId) -> Result<AssetDescriptor, CollaboratorError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OracleClient: Send + Sync {
    /// Samples observed after `since`, oldest first
    async fn latest_samples(
        &self,
        asset_id: &AssetId,
        since: DateTime<Utc>,
    ) -> Result<Vec<PriceSample>, CollaboratorError>;
}

/// Funds rail. `reference` is stable per (settlement, movement) so the rail
/// can deduplicate a movement the caller re-submits after a timeout.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FundsRail: Send + Sync {
    /// Move buyer funds into escrow
    async fn hold(
        &self,
        from: &PartyId,
        to: &PartyId,
        amount: Decimal,
        reference: &str,
    ) -> Result<TransferReceipt, CollaboratorError>;

    /// Pay out of escrow to the seller
    async fn release(
        &self,
        from: &PartyId,
        to: &PartyId,
        amount: Decimal,
        reference: &str,
    ) -> Result<TransferReceipt, CollaboratorError>;

    /// Return escrow to the buyer
    async fn refund(
        &self,
        from: &PartyId,
        to: &PartyId,
        amount: Decimal,
        reference: &str,
    ) -> Result<TransferReceipt, CollaboratorError>;
}

/// Await a collaborator call under `timeout` and map its failure
pub async fn guarded<T, F>(collaborator: &'static str, timeout: Duration, call: F) -> AcseResult<T>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(CollaboratorError::AssetNotFound(asset_id))) => Err(AcseError::AssetNotFound {
            asset_id: asset_id.to_string(),
        }),
        Ok(Err(e)) => Err(AcseError::CollaboratorFailed {
            collaborator: collaborator.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(AcseError::CollaboratorTimeout {
            collaborator: collaborator.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acse_core::ErrorKind;

    #[tokio::test]
    async fn test_guarded_maps_not_found() {
        let mut registry = MockRegistryClient::new();
        registry
            .expect_get_asset()
            .returning(|id| Err(CollaboratorError::AssetNotFound(id.clone())));

        let err = guarded(REGISTRY, Duration::from_secs(1), registry.get_asset(&AssetId::new("a")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AssetNotFound);
    }

    #[tokio::test]
    async fn test_guarded_maps_failure_as_retryable() {
        let mut rail = MockFundsRail::new();
        rail.expect_hold()
            .returning(|_, _, _, _| Err(CollaboratorError::Unavailable("maintenance".into())));

        let err = guarded(
            FUNDS_RAIL,
            Duration::from_secs(1),
            rail.hold(&PartyId::new("b"), &PartyId::new("e"), Decimal::ONE, "stl:1:hold"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CollaboratorFailed);
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_times_out() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, CollaboratorError>(())
        };
        let err = guarded(ORACLE, Duration::from_millis(50), slow).await.unwrap_err();
        assert_eq!(
            err,
            AcseError::CollaboratorTimeout {
                collaborator: ORACLE.to_string(),
                timeout_ms: 50
            }
        );
    }
}
