//! Verification Types
//!
//! A `VerificationRequest` moves exactly once from PENDING to a terminal status.
//! `Attestation` rows are append-only and hash-chained per request.
//! `VerificationRecord` is a projection recomputed from the rows, never stored.

use super::common::{AssetId, AttestorId, CategoryKey, Digest, EvidenceRef, PartyId, RequestId, Score};
use super::policy::Policy;
use crate::error::{AcseError, AcseResult};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Verification status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Rejected,
    Expired,
}

impl VerificationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Verified => "VERIFIED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Manual review state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReviewState {
    /// Policy does not require review
    NotRequired,
    /// Review required, attestation not yet complete
    Required,
    /// Fully attested above threshold, waiting for a reviewer
    Awaiting { since: DateTime<Utc> },
    /// Reviewer approved
    Approved {
        reviewer: PartyId,
        at: DateTime<Utc>,
        note: Option<String>,
    },
    /// Reviewer declined
    Declined {
        reviewer: PartyId,
        at: DateTime<Utc>,
        note: Option<String>,
    },
}

/// One asset's pending trust evaluation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub request_id: RequestId,
    pub asset_id: AssetId,
    pub category: CategoryKey,
    pub submitter: PartyId,
    pub evidence: Vec<EvidenceRef>,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// Assigned attestors in ranking order; size == policy.required_attestors
    pub assigned: Vec<AttestorId>,
    /// Policy snapshot taken at submission
    pub policy: Policy,
    pub status: VerificationStatus,
    pub review: ReviewState,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl VerificationRequest {
    /// Open a new request under `policy`
    pub fn open(
        asset_id: AssetId,
        submitter: PartyId,
        evidence: Vec<EvidenceRef>,
        assigned: Vec<AttestorId>,
        policy: Policy,
        now: DateTime<Utc>,
    ) -> Self {
        let review = if policy.manual_review {
            ReviewState::Required
        } else {
            ReviewState::NotRequired
        };
        Self {
            request_id: RequestId::generate(),
            asset_id,
            category: policy.category.clone(),
            submitter,
            evidence,
            created_at: now,
            deadline: now + policy.expiry(),
            assigned,
            policy,
            status: VerificationStatus::Pending,
            review,
            finalized_at: None,
        }
    }

    pub fn is_assigned(&self, attestor_id: &AttestorId) -> bool {
        self.assigned.contains(attestor_id)
    }

    /// Strictly after the deadline
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    pub fn is_awaiting_review(&self) -> bool {
        matches!(self.review, ReviewState::Awaiting { .. })
    }

    pub fn closed_error(&self) -> AcseError {
        AcseError::RequestClosed {
            request_id: self.request_id.to_string(),
            status: self.status.to_string(),
        }
    }

    /// Single terminal transition. A terminal request never changes again.
    pub fn finalize(&mut self, status: VerificationStatus, now: DateTime<Utc>) -> AcseResult<()> {
        if !status.is_terminal() {
            return Err(AcseError::invariant(
                "terminal transition",
                format!("{} cannot be a finalization target", status),
            ));
        }
        if self.status.is_terminal() {
            return Err(self.closed_error());
        }
        self.status = status;
        self.finalized_at = Some(now);
        Ok(())
    }
}

/// One attestor's scored judgment (append-only)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub request_id: RequestId,
    pub attestor_id: AttestorId,
    pub score: Score,
    pub rationale: String,
    pub submitted_at: DateTime<Utc>,
    /// Position in the request's ledger, starting at 1
    pub sequence: u32,
    /// Digest of the previous row (zero for the first)
    pub prev_digest: Digest,
    /// Digest binding this row to the chain
    pub chain_digest: Digest,
}

impl Attestation {
    /// Build the next row of a request's ledger
    pub fn append_to(
        prev: Option<&Attestation>,
        request_id: RequestId,
        attestor_id: AttestorId,
        score: Score,
        rationale: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let (sequence, prev_digest) = match prev {
            Some(p) => (p.sequence + 1, p.chain_digest),
            None => (1, Digest::zero()),
        };
        let rationale = rationale.into();
        let chain_digest = Self::compute_digest(
            &prev_digest,
            &request_id,
            &attestor_id,
            score,
            &rationale,
            sequence,
            now,
        );
        Self {
            request_id,
            attestor_id,
            score,
            rationale,
            submitted_at: now,
            sequence,
            prev_digest,
            chain_digest,
        }
    }

    fn compute_digest(
        prev: &Digest,
        request_id: &RequestId,
        attestor_id: &AttestorId,
        score: Score,
        rationale: &str,
        sequence: u32,
        at: DateTime<Utc>,
    ) -> Digest {
        let mut buf = Vec::with_capacity(96 + rationale.len());
        buf.extend_from_slice(&prev.0);
        buf.extend_from_slice(&sequence.to_be_bytes());
        buf.extend_from_slice(request_id.as_str().as_bytes());
        buf.push(0);
        buf.extend_from_slice(attestor_id.as_str().as_bytes());
        buf.push(0);
        buf.extend_from_slice(&score.value().to_be_bytes());
        buf.extend_from_slice(&at.timestamp_millis().to_be_bytes());
        buf.extend_from_slice(rationale.as_bytes());
        Digest::blake3(&buf)
    }

    /// Recompute this row's digest from its contents
    pub fn recompute_digest(&self) -> Digest {
        Self::compute_digest(
            &self.prev_digest,
            &self.request_id,
            &self.attestor_id,
            self.score,
            &self.rationale,
            self.sequence,
            self.submitted_at,
        )
    }
}

/// Verify an ordered ledger: sequence continuity, prev links and digests
pub fn verify_chain(rows: &[Attestation]) -> AcseResult<()> {
    let mut prev = Digest::zero();
    for (idx, row) in rows.iter().enumerate() {
        let expected_seq = idx as u32 + 1;
        if row.sequence != expected_seq {
            return Err(AcseError::invariant(
                "attestation ledger",
                format!("expected sequence {}, found {}", expected_seq, row.sequence),
            ));
        }
        if row.prev_digest != prev || row.recompute_digest() != row.chain_digest {
            return Err(AcseError::invariant(
                "attestation ledger",
                format!("digest mismatch at sequence {}", row.sequence),
            ));
        }
        prev = row.chain_digest;
    }
    Ok(())
}

/// Derived aggregate for one request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub request_id: RequestId,
    pub asset_id: AssetId,
    pub average_score: Decimal,
    pub attestation_count: u32,
    pub required_attestors: u32,
    pub status: VerificationStatus,
    pub awaiting_review: bool,
}

impl VerificationRecord {
    /// Recompute from the request and its attestation rows
    pub fn project(request: &VerificationRequest, rows: &[Attestation]) -> AcseResult<Self> {
        let count = rows.len() as u32;
        if count > request.policy.required_attestors {
            return Err(AcseError::invariant(
                "attestation count",
                format!(
                    "request {} has {} attestations, policy requires {}",
                    request.request_id, count, request.policy.required_attestors
                ),
            ));
        }
        Ok(Self {
            request_id: request.request_id.clone(),
            asset_id: request.asset_id.clone(),
            average_score: average_score(rows),
            attestation_count: count,
            required_attestors: request.policy.required_attestors,
            status: request.status,
            awaiting_review: request.is_awaiting_review(),
        })
    }

    pub fn is_complete(&self) -> bool {
        self.attestation_count == self.required_attestors
    }
}

/// `sum(scores) / count`, zero for no rows
pub fn average_score(rows: &[Attestation]) -> Decimal {
    if rows.is_empty() {
        return Decimal::ZERO;
    }
    let sum: u64 = rows.iter().map(|r| u64::from(r.score.value())).sum();
    Decimal::from(sum) / Decimal::from(rows.len() as u64)
}

/// Consensus outcome once attestation is complete
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsensusOutcome {
    /// Fewer attestations than required
    Incomplete,
    /// Average >= min score, no review needed
    Verified,
    /// Average >= min score, reviewer must approve
    AwaitingReview,
    /// Average < min score
    Rejected,
}

/// Threshold rule: VERIFIED iff count == required and average >= min score
pub fn evaluate(policy: &Policy, record: &VerificationRecord) -> ConsensusOutcome {
    if record.attestation_count < policy.required_attestors {
        return ConsensusOutcome::Incomplete;
    }
    if record.average_score >= Decimal::from(policy.min_score.value()) {
        if policy.manual_review {
            ConsensusOutcome::AwaitingReview
        } else {
            ConsensusOutcome::Verified
        }
    } else {
        ConsensusOutcome::Rejected
    }
}

/// Largest pairwise score gap among rows
pub fn score_spread(rows: &[Attestation]) -> u32 {
    let max = rows.iter().map(|r| r.score.value()).max().unwrap_or(0);
    let min = rows.iter().map(|r| r.score.value()).min().unwrap_or(0);
    max - min
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::policy::PolicyParams;

    fn policy(min: u32, required: u32, review: bool) -> Policy {
        Policy::from_params(
            CategoryKey::new("AGRICULTURAL"),
            &PolicyParams::new(min, required, 30).with_manual_review(review),
            1,
            Utc::now(),
        )
        .unwrap()
    }

    fn request(p: Policy) -> VerificationRequest {
        VerificationRequest::open(
            AssetId::new("asset:farm-1"),
            PartyId::new("owner"),
            vec![EvidenceRef::new("doc://deed")],
            vec![AttestorId::new("att:a"), AttestorId::new("att:b")],
            p,
            Utc::now(),
        )
    }

    fn rows(req: &VerificationRequest, scores: &[u32]) -> Vec<Attestation> {
        let mut out: Vec<Attestation> = Vec::new();
        for (i, s) in scores.iter().enumerate() {
            let row = Attestation::append_to(
                out.last(),
                req.request_id.clone(),
                AttestorId::new(format!("att:{}", i)),
                Score::new(*s).unwrap(),
                "ok",
                Utc::now(),
            );
            out.push(row);
        }
        out
    }

    #[test]
    fn test_deadline_from_policy() {
        let req = request(policy(7000, 2, false));
        assert_eq!(req.deadline - req.created_at, chrono::Duration::days(30));
        assert!(!req.is_past_deadline(req.deadline));
        assert!(req.is_past_deadline(req.deadline + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_verified_above_threshold() {
        let p = policy(7000, 2, false);
        let req = request(p.clone());
        let record = VerificationRecord::project(&req, &rows(&req, &[8000, 9000])).unwrap();
        assert_eq!(record.average_score, Decimal::from(8500));
        assert_eq!(evaluate(&p, &record), ConsensusOutcome::Verified);
    }

    #[test]
    fn test_rejected_below_threshold() {
        let p = policy(7000, 2, false);
        let req = request(p.clone());
        let record = VerificationRecord::project(&req, &rows(&req, &[5000, 6000])).unwrap();
        assert_eq!(record.average_score, Decimal::from(5500));
        assert_eq!(evaluate(&p, &record), ConsensusOutcome::Rejected);
    }

    #[test]
    fn test_incomplete_and_review() {
        let p = policy(7000, 2, true);
        let req = request(p.clone());
        let partial = VerificationRecord::project(&req, &rows(&req, &[9000])).unwrap();
        assert_eq!(evaluate(&p, &partial), ConsensusOutcome::Incomplete);
        let full = VerificationRecord::project(&req, &rows(&req, &[9000, 9000])).unwrap();
        assert_eq!(evaluate(&p, &full), ConsensusOutcome::AwaitingReview);
    }

    #[test]
    fn test_projection_rejects_overflow() {
        let req = request(policy(7000, 2, false));
        let err = VerificationRecord::project(&req, &rows(&req, &[1, 2, 3])).unwrap_err();
        assert!(matches!(err, AcseError::InvariantViolation { .. }));
    }

    #[test]
    fn test_fractional_average_is_exact() {
        let req = request(policy(5001, 2, false));
        let record = VerificationRecord::project(&req, &rows(&req, &[5000, 5001])).unwrap();
        assert_eq!(record.average_score, Decimal::new(50005, 1));
        assert_eq!(evaluate(&req.policy, &record), ConsensusOutcome::Rejected);
    }

    #[test]
    fn test_finalize_once() {
        let mut req = request(policy(7000, 2, false));
        req.finalize(VerificationStatus::Expired, Utc::now()).unwrap();
        let err = req
            .finalize(VerificationStatus::Verified, Utc::now())
            .unwrap_err();
        assert!(matches!(err, AcseError::RequestClosed { .. }));
        assert_eq!(req.status, VerificationStatus::Expired);
    }

    #[test]
    fn test_chain_verifies_and_detects_tamper() {
        let req = request(policy(7000, 3, false));
        let mut ledger = rows(&req, &[8000, 9000, 7000]);
        assert!(verify_chain(&ledger).is_ok());
        ledger[1].rationale = "edited".to_string();
        assert!(verify_chain(&ledger).is_err());
    }

    #[test]
    fn test_spread() {
        let req = request(policy(7000, 3, false));
        assert_eq!(score_spread(&rows(&req, &[2000, 9000, 7000])), 7000);
        assert_eq!(score_spread(&[]), 0);
    }
}
