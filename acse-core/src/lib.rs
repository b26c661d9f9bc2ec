//! ACSE Core - Attestation Consensus & Settlement domain
//!
//! Pure domain layer of the engine:
//! - **Attestors**: staked verifiers with reputation and exactly-once slashing
//! - **Policies**: per-category thresholds, versioned by replacement
//! - **Verification**: requests, hash-chained attestations, derived records
//! - **Valuation**: sample admission and the freshness/volatility check
//! - **Settlement**: escrow state machine with conservation checks
//!
//! # Invariants
//!
//! | Invariant | Requirement |
//! |-----------|-------------|
//! | **Monotonic finality** | A terminal request or settlement never changes status |
//! | **Bounded attestation** | Attestation count never exceeds required attestors |
//! | **Escrow conservation** | seller + fee == amount on confirm, buyer == amount on refund |
//! | **Exactly-once slashing** | One slash per violation ref, stake never below zero |
//!
//! No I/O and no async here; `acse-store` persists these types and
//! `acse-engine` orchestrates them.

pub mod clock;
pub mod error;
pub mod ranking;
pub mod reputation;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{AcseError, AcseResult, ErrorClass, ErrorKind};
pub use ranking::{
    JurisdictionAffinityRanking, RankingContext, RankingStrategy, ReputationLoadRanking,
};
pub use reputation::{ReputationChange, ReputationConfig};

// Re-export all types
pub use types::*;
