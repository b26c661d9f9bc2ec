//! Attestor Registry
//!
//! Owns attestor identity, stake, reputation and activity. Every mutation of an
//! attestor row runs under that attestor's lock; registration additionally holds
//! a per-identity lock so two concurrent registrations cannot both pass the
//! uniqueness check.

use std::sync::Arc;

use acse_core::reputation::adjust;
use acse_core::{
    AcseError, AcseResult, Attestor, AttestorId, AttestorRegistration, Clock, DeactivationReason,
    DomainEvent, RequestId, ReputationChange, SlashOutcome,
};
use acse_store::EngineStorage;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::AttestorConfig;
use crate::events::EventBus;
use crate::locks::EntityLocks;

pub struct AttestorRegistry {
    storage: Arc<dyn EngineStorage>,
    config: AttestorConfig,
    locks: EntityLocks<AttestorId>,
    identity_locks: EntityLocks<String>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl AttestorRegistry {
    pub fn new(
        storage: Arc<dyn EngineStorage>,
        config: AttestorConfig,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            config,
            locks: EntityLocks::new(),
            identity_locks: EntityLocks::new(),
            events,
            clock,
        }
    }

    pub fn config(&self) -> &AttestorConfig {
        &self.config
    }

    /// Register a new attestor
    pub async fn register(&self, registration: AttestorRegistration) -> AcseResult<Attestor> {
        if registration.stake < self.config.min_stake {
            return Err(AcseError::InsufficientStake {
                required: self.config.min_stake,
                provided: registration.stake,
            });
        }
        if registration.identity.trim().is_empty() {
            return Err(AcseError::InvalidAmount {
                reason: "identity must not be empty".to_string(),
            });
        }

        let _guard = self.identity_locks.lock(&registration.identity).await;
        if self
            .storage
            .get_attestor_by_identity(&registration.identity)
            .await?
            .is_some()
        {
            return Err(AcseError::DuplicateIdentity {
                identity: registration.identity,
            });
        }

        let now = self.clock.now();
        let attestor = Attestor::new(
            registration.identity,
            registration.organization,
            registration.jurisdiction,
            registration.stake,
            self.config.initial_reputation,
            now,
        );
        self.storage.save_attestor(&attestor).await?;

        info!(
            attestor_id = %attestor.attestor_id,
            identity = %attestor.identity,
            stake = %attestor.stake,
            "Attestor registered"
        );
        self.events.publish(DomainEvent::AttestorRegistered {
            attestor_id: attestor.attestor_id.clone(),
            identity: attestor.identity.clone(),
            stake: attestor.stake,
            at: now,
        });
        Ok(attestor)
    }

    /// Slash stake for a provable violation. Deactivates when stake drops below the minimum.
    pub async fn slash(
        &self,
        attestor_id: &AttestorId,
        amount: Decimal,
        violation_ref: &str,
        reason: &str,
    ) -> AcseResult<SlashOutcome> {
        if violation_ref.trim().is_empty() {
            return Err(AcseError::InvalidAmount {
                reason: "violation reference must not be empty".to_string(),
            });
        }

        let _guard = self.locks.lock(attestor_id).await;
        let mut attestor = self.load(attestor_id).await?;
        let now = self.clock.now();

        let outcome = attestor.apply_slash(amount, violation_ref, now)?;
        let deactivated = attestor.stake < self.config.min_stake
            && attestor.deactivate(DeactivationReason::StakeBelowMinimum, now);
        self.storage.save_attestor(&attestor).await?;

        warn!(
            attestor_id = %attestor_id,
            violation_ref,
            applied = %outcome.applied,
            new_stake = %outcome.new_stake,
            "Attestor slashed: {}",
            reason
        );
        self.events.publish(DomainEvent::AttestorSlashed {
            attestor_id: attestor_id.clone(),
            violation_ref: violation_ref.to_string(),
            reason: reason.to_string(),
            applied: outcome.applied,
            new_stake: outcome.new_stake,
            at: now,
        });
        if deactivated {
            self.announce_deactivation(attestor_id, DeactivationReason::StakeBelowMinimum, now);
        }
        Ok(outcome)
    }

    /// Top up stake; cures a low-stake deactivation
    pub async fn add_stake(&self, attestor_id: &AttestorId, amount: Decimal) -> AcseResult<Attestor> {
        if amount <= Decimal::ZERO {
            return Err(AcseError::InvalidAmount {
                reason: "Stake top-up must be positive".to_string(),
            });
        }

        let _guard = self.locks.lock(attestor_id).await;
        let mut attestor = self.load(attestor_id).await?;
        let now = self.clock.now();

        attestor.stake += amount;
        attestor.updated_at = now;
        if attestor.deactivation == Some(DeactivationReason::StakeBelowMinimum)
            && attestor.stake >= self.config.min_stake
        {
            attestor.reactivate(now);
            info!(attestor_id = %attestor_id, stake = %attestor.stake, "Attestor reactivated");
        }
        self.storage.save_attestor(&attestor).await?;
        Ok(attestor)
    }

    /// Voluntary exit. Stake stays with the attestor record.
    pub async fn deactivate(&self, attestor_id: &AttestorId) -> AcseResult<Attestor> {
        let _guard = self.locks.lock(attestor_id).await;
        let mut attestor = self.load(attestor_id).await?;
        let now = self.clock.now();

        if attestor.deactivate(DeactivationReason::Voluntary, now) {
            self.storage.save_attestor(&attestor).await?;
            self.announce_deactivation(attestor_id, DeactivationReason::Voluntary, now);
        }
        Ok(attestor)
    }

    pub async fn get(&self, attestor_id: &AttestorId) -> AcseResult<Attestor> {
        self.load(attestor_id).await
    }

    pub async fn list(&self) -> AcseResult<Vec<Attestor>> {
        Ok(self.storage.list_attestors().await?)
    }

    /// Bump the load counter of each selected attestor
    pub async fn reserve_assignments(&self, attestor_ids: &[AttestorId]) -> AcseResult<()> {
        for attestor_id in attestor_ids {
            let _guard = self.locks.lock(attestor_id).await;
            let mut attestor = self.load(attestor_id).await?;
            attestor.active_assignments = attestor.active_assignments.saturating_add(1);
            self.storage.save_attestor(&attestor).await?;
        }
        debug!(count = attestor_ids.len(), "Assignments reserved");
        Ok(())
    }

    /// Drop one unit of load, e.g. when a request expires before the attestor answered
    pub async fn release_assignment(&self, attestor_id: &AttestorId) -> AcseResult<()> {
        let _guard = self.locks.lock(attestor_id).await;
        let mut attestor = self.load(attestor_id).await?;
        attestor.active_assignments = attestor.active_assignments.saturating_sub(1);
        self.storage.save_attestor(&attestor).await?;
        Ok(())
    }

    /// Apply one reputation step after finalization and release the assignment
    pub async fn adjust_reputation(
        &self,
        attestor_id: &AttestorId,
        request_id: &RequestId,
        score: u32,
        average: Decimal,
        tolerance: u32,
    ) -> AcseResult<ReputationChange> {
        let _guard = self.locks.lock(attestor_id).await;
        let mut attestor = self.load(attestor_id).await?;
        let now = self.clock.now();

        let change = adjust(
            &self.config.reputation,
            attestor.reputation,
            score,
            average,
            tolerance,
        );
        attestor.reputation = change.current;
        attestor.active_assignments = attestor.active_assignments.saturating_sub(1);
        attestor.updated_at = now;
        let deactivated = change.current < self.config.reputation.floor
            && attestor.deactivate(DeactivationReason::ReputationBelowFloor, now);
        self.storage.save_attestor(&attestor).await?;

        debug!(
            attestor_id = %attestor_id,
            request_id = %request_id,
            previous = change.previous,
            current = change.current,
            delta = change.delta(),
            "Reputation adjusted"
        );
        if change.fell_below_floor {
            warn!(
                attestor_id = %attestor_id,
                request_id = %request_id,
                reputation = change.current,
                floor = self.config.reputation.floor,
                "Reputation fell below floor"
            );
        }
        self.events.publish(DomainEvent::ReputationAdjusted {
            attestor_id: attestor_id.clone(),
            request_id: request_id.clone(),
            previous: change.previous,
            current: change.current,
            at: now,
        });
        if deactivated {
            self.announce_deactivation(attestor_id, DeactivationReason::ReputationBelowFloor, now);
        }
        Ok(change)
    }

    /// Drop idle lock entries
    pub fn prune_locks(&self) -> usize {
        self.locks.prune() + self.identity_locks.prune()
    }

    async fn load(&self, attestor_id: &AttestorId) -> AcseResult<Attestor> {
        self.storage
            .get_attestor(attestor_id)
            .await?
            .ok_or_else(|| AcseError::AttestorNotFound {
                attestor_id: attestor_id.to_string(),
            })
    }

    fn announce_deactivation(
        &self,
        attestor_id: &AttestorId,
        reason: DeactivationReason,
        at: chrono::DateTime<chrono::Utc>,
    ) {
        warn!(attestor_id = %attestor_id, reason = ?reason, "Attestor deactivated");
        self.events.publish(DomainEvent::AttestorDeactivated {
            attestor_id: attestor_id.clone(),
            reason,
            at,
        });
    }
}
