//! Attestor Ranking
//!
//! Selection is a pure function of the candidate set and the request context,
//! so strategies can be swapped without touching the consensus state machine.

use crate::types::{AssetId, Attestor, AttestorId, CategoryKey, PartyId};
use std::cmp::Ordering;

/// What the strategy may look at
#[derive(Clone, Debug)]
pub struct RankingContext {
    pub asset_id: AssetId,
    pub category: CategoryKey,
    pub submitter: PartyId,
    /// Jurisdiction reported by the asset registry, if any
    pub jurisdiction: Option<String>,
}

/// Pluggable ranking strategy
pub trait RankingStrategy: Send + Sync {
    /// Strategy name for logs
    fn name(&self) -> &'static str;

    /// Order eligible candidates, best first
    fn rank(&self, candidates: Vec<Attestor>, ctx: &RankingContext) -> Vec<Attestor>;
}

/// Highest reputation first, then lowest assignment load, then id
#[derive(Clone, Copy, Debug, Default)]
pub struct ReputationLoadRanking;

impl ReputationLoadRanking {
    fn compare(a: &Attestor, b: &Attestor) -> Ordering {
        b.reputation
            .cmp(&a.reputation)
            .then(a.active_assignments.cmp(&b.active_assignments))
            .then_with(|| a.attestor_id.cmp(&b.attestor_id))
    }
}

impl RankingStrategy for ReputationLoadRanking {
    fn name(&self) -> &'static str {
        "reputation_load"
    }

    fn rank(&self, mut candidates: Vec<Attestor>, _ctx: &RankingContext) -> Vec<Attestor> {
        candidates.sort_by(Self::compare);
        candidates
    }
}

/// Attestors in the asset's jurisdiction first, each group ordered by `inner`
pub struct JurisdictionAffinityRanking<S> {
    inner: S,
}

impl<S: RankingStrategy> JurisdictionAffinityRanking<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: RankingStrategy> RankingStrategy for JurisdictionAffinityRanking<S> {
    fn name(&self) -> &'static str {
        "jurisdiction_affinity"
    }

    fn rank(&self, candidates: Vec<Attestor>, ctx: &RankingContext) -> Vec<Attestor> {
        let Some(jurisdiction) = ctx.jurisdiction.as_deref() else {
            return self.inner.rank(candidates, ctx);
        };
        let (local, other): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|a| a.jurisdiction.eq_ignore_ascii_case(jurisdiction));
        let mut ranked = self.inner.rank(local, ctx);
        ranked.extend(self.inner.rank(other, ctx));
        ranked
    }
}

/// Filter to assignable candidates not controlled by the submitter, rank, take `n`
pub fn select(
    strategy: &dyn RankingStrategy,
    candidates: Vec<Attestor>,
    ctx: &RankingContext,
    n: usize,
) -> Vec<AttestorId> {
    let eligible: Vec<Attestor> = candidates
        .into_iter()
        .filter(|a| a.is_assignable() && a.identity != ctx.submitter.as_str())
        .collect();
    strategy
        .rank(eligible, ctx)
        .into_iter()
        .take(n)
        .map(|a| a.attestor_id)
        .collect()
}
