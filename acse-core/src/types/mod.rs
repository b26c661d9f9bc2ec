//! ACSE Core Type Definitions
//!
//! All types follow these naming conventions:
//! - snake_case for field names
//! - *_id suffix for primary keys
//! - *_ref suffix for references
//! - *_digest suffix for digests

pub mod attestor;
pub mod common;
pub mod events;
pub mod policy;
pub mod settlement;
pub mod valuation;
pub mod verification;

// Re-export common types
pub use common::{
    // Digest
    Digest,
    // ID types
    AssetId, AttestorId, CategoryKey, PartyId, RequestId, SettlementId,
    // Values
    Score, EvidenceRef, Caller, Role, MAX_SCORE, validate_evidence,
};

pub use attestor::{Attestor, AttestorRegistration, DeactivationReason, SlashOutcome};
pub use events::DomainEvent;
pub use policy::{Policy, PolicyParams, DEFAULT_DEVIATION_TOLERANCE};
pub use settlement::{
    max_settlement_amount, split_fee, DisputeInfo, DisputeResolution, Settlement,
    SettlementDraft, SettlementStatus, TransferKind,
};
pub use valuation::{
    admit_sample, evict_before, summarize, Admission, PriceSample, ToleranceFailure,
    ToleranceParams, Valuation,
};
pub use verification::{
    average_score, evaluate, score_spread, verify_chain, Attestation, ConsensusOutcome,
    ReviewState, VerificationRecord, VerificationRequest, VerificationStatus,
};
