//! Policy Store
//!
//! Readers go through an `ArcSwap` snapshot and never block. Writers are
//! serialized by a single async mutex, append a new version to storage, then
//! publish a fresh snapshot. Requests keep the version they were opened under.

use std::collections::HashMap;
use std::sync::Arc;

use acse_core::{
    AcseError, AcseResult, Caller, CategoryKey, Clock, DomainEvent, Policy, PolicyParams, Role,
};
use acse_store::EngineStorage;
use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::events::EventBus;

type Snapshot = HashMap<CategoryKey, Arc<Policy>>;

pub struct PolicyStore {
    storage: Arc<dyn EngineStorage>,
    snapshot: ArcSwap<Snapshot>,
    write_lock: Mutex<()>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl PolicyStore {
    pub fn new(storage: Arc<dyn EngineStorage>, events: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            snapshot: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
            events,
            clock,
        }
    }

    /// Rebuild the snapshot from storage
    pub async fn load(&self) -> AcseResult<usize> {
        let policies = self.storage.list_latest_policies().await?;
        let snapshot: Snapshot = policies
            .into_iter()
            .map(|p| (p.category.clone(), Arc::new(p)))
            .collect();
        let count = snapshot.len();
        self.snapshot.store(Arc::new(snapshot));
        info!(count, "Policies loaded");
        Ok(count)
    }

    /// Idempotent upsert; a changed parameter set becomes a new version
    pub async fn set_policy(
        &self,
        caller: &Caller,
        category: CategoryKey,
        params: PolicyParams,
    ) -> AcseResult<Arc<Policy>> {
        caller.require(Role::Governance, "set_policy")?;
        params.validate()?;
        if category.as_str().trim().is_empty() {
            return Err(AcseError::InvalidPolicy {
                reason: "category must not be empty".to_string(),
            });
        }

        let _guard = self.write_lock.lock().await;
        let current = self.snapshot.load().get(&category).cloned();
        if let Some(existing) = current.as_ref().filter(|p| p.matches(&params)) {
            debug!(category = %category, version = existing.version, "Policy unchanged");
            return Ok(existing.clone());
        }

        let now = self.clock.now();
        let version = current.map(|p| p.version + 1).unwrap_or(1);
        let policy = Arc::new(Policy::from_params(category.clone(), &params, version, now)?);
        self.storage.append_policy(&policy).await?;

        let mut next: Snapshot = (**self.snapshot.load()).clone();
        next.insert(category.clone(), policy.clone());
        self.snapshot.store(Arc::new(next));

        info!(
            category = %category,
            version,
            min_score = policy.min_score.value(),
            required_attestors = policy.required_attestors,
            "Policy updated"
        );
        self.events.publish(DomainEvent::PolicyUpdated {
            category,
            version,
            at: now,
        });
        Ok(policy)
    }

    /// Current policy; there is no fallback for unknown categories
    pub fn get_policy(&self, category: &CategoryKey) -> AcseResult<Arc<Policy>> {
        self.snapshot
            .load()
            .get(category)
            .cloned()
            .ok_or_else(|| AcseError::PolicyNotFound {
                category: category.to_string(),
            })
    }

    pub fn list(&self) -> Vec<Arc<Policy>> {
        let mut policies: Vec<_> = self.snapshot.load().values().cloned().collect();
        policies.sort_by(|a, b| a.category.cmp(&b.category));
        policies
    }

    /// Every version of a category, oldest first
    pub async fn history(&self, category: &CategoryKey) -> AcseResult<Vec<Policy>> {
        Ok(self.storage.get_policy_history(category).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acse_core::{ErrorKind, SystemClock};
    use acse_store::MemoryStorage;

    fn store() -> (PolicyStore, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let store = PolicyStore::new(storage.clone(), EventBus::new(8), Arc::new(SystemClock));
        (store, storage)
    }

    fn governance() -> Caller {
        Caller::from("gov").with_role(Role::Governance)
    }

    fn agri() -> CategoryKey {
        CategoryKey::new("AGRICULTURAL")
    }

    #[tokio::test]
    async fn test_unknown_category_is_hard_failure() {
        let (store, _) = store();
        let err = store.get_policy(&agri()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PolicyNotFound);
    }

    #[tokio::test]
    async fn test_requires_governance_before_validation() {
        let (store, _) = store();
        let err = store
            .set_policy(&Caller::from("owner"), agri(), PolicyParams::new(7000, 0, 30))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        let err = store
            .set_policy(&governance(), agri(), PolicyParams::new(7000, 0, 30))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPolicy);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_and_versioned() {
        let (store, _) = store();
        let params = PolicyParams::new(7000, 2, 30);

        let v1 = store.set_policy(&governance(), agri(), params.clone()).await.unwrap();
        let again = store.set_policy(&governance(), agri(), params).await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(again.version, 1);

        let v2 = store
            .set_policy(&governance(), agri(), PolicyParams::new(8000, 3, 30))
            .await
            .unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(store.get_policy(&agri()).unwrap().min_score.value(), 8000);
        assert_eq!(store.history(&agri()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_load_restores_latest_versions() {
        let (store, storage) = store();
        store
            .set_policy(&governance(), agri(), PolicyParams::new(7000, 2, 30))
            .await
            .unwrap();
        store
            .set_policy(&governance(), agri(), PolicyParams::new(7500, 2, 30))
            .await
            .unwrap();

        let fresh = PolicyStore::new(storage, EventBus::new(8), Arc::new(SystemClock));
        assert_eq!(fresh.load().await.unwrap(), 1);
        let policy = fresh.get_policy(&agri()).unwrap();
        assert_eq!(policy.version, 2);
        assert_eq!(policy.min_score.value(), 7500);
        assert_eq!(fresh.list().len(), 1);
    }
}
