//! ACSE Error Codes Registry
//!
//! Error code format: ACSE-{module}-{sequence}
//! - ACSE-ATTESTOR: Attestor registry errors
//! - ACSE-POLICY: Policy errors
//! - ACSE-AUTH: Authorization errors
//! - ACSE-VERIFY: Verification request / attestation errors
//! - ACSE-VALUATION: Valuation buffer errors
//! - ACSE-SETTLE: Settlement errors
//! - ACSE-COLLAB: External collaborator errors
//! - ACSE-STORE: Persistence errors
//! - ACSE-FATAL: Invariant violations
//!
//! Callers branch on [`AcseError::kind`], never on the message text.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ACSE Result type
pub type AcseResult<T> = Result<T, AcseError>;

/// ACSE Error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcseError {
    // ============================================================
    // Attestor Errors (ACSE-ATTESTOR-*)
    // ============================================================
    /// [ACSE-ATTESTOR-001] Stake below the global minimum
    #[error("[ACSE-ATTESTOR-001] Stake {provided} below required minimum {required}")]
    InsufficientStake { required: Decimal, provided: Decimal },

    /// [ACSE-ATTESTOR-002] Identity already registered
    #[error("[ACSE-ATTESTOR-002] Identity {identity} already registered")]
    DuplicateIdentity { identity: String },

    /// [ACSE-ATTESTOR-003] Attestor not found
    #[error("[ACSE-ATTESTOR-003] Attestor {attestor_id} not found")]
    AttestorNotFound { attestor_id: String },

    /// [ACSE-ATTESTOR-004] Violation already slashed
    #[error("[ACSE-ATTESTOR-004] Violation {violation_ref} already slashed for attestor {attestor_id}")]
    ViolationAlreadySlashed {
        attestor_id: String,
        violation_ref: String,
    },

    // ============================================================
    // Policy Errors (ACSE-POLICY-*)
    // ============================================================
    /// [ACSE-POLICY-001] No policy set for category
    #[error("[ACSE-POLICY-001] No policy set for category {category}")]
    PolicyNotFound { category: String },

    /// [ACSE-POLICY-002] Policy parameters invalid
    #[error("[ACSE-POLICY-002] Invalid policy: {reason}")]
    InvalidPolicy { reason: String },

    // ============================================================
    // Authorization Errors (ACSE-AUTH-*)
    // ============================================================
    /// [ACSE-AUTH-001] Caller lacks the role or party binding for the action
    #[error("[ACSE-AUTH-001] Caller {caller} is not authorized to {action}")]
    Unauthorized { caller: String, action: String },

    // ============================================================
    // Verification Errors (ACSE-VERIFY-*)
    // ============================================================
    /// [ACSE-VERIFY-001] Not enough active attestors to staff the request
    #[error("[ACSE-VERIFY-001] Policy requires {required} attestors, only {available} available")]
    InsufficientAttestors { required: u32, available: u32 },

    /// [ACSE-VERIFY-002] Attestor not assigned to request
    #[error("[ACSE-VERIFY-002] Attestor {attestor_id} is not assigned to request {request_id}")]
    NotAssigned {
        request_id: String,
        attestor_id: String,
    },

    /// [ACSE-VERIFY-003] Attestation already recorded for (request, attestor)
    #[error("[ACSE-VERIFY-003] Attestor {attestor_id} already attested request {request_id}")]
    AlreadyAttested {
        request_id: String,
        attestor_id: String,
    },

    /// [ACSE-VERIFY-004] Request is terminal or past its deadline
    #[error("[ACSE-VERIFY-004] Request {request_id} is closed ({status})")]
    RequestClosed { request_id: String, status: String },

    /// [ACSE-VERIFY-005] Score outside [0, 10000]
    #[error("[ACSE-VERIFY-005] Score {score} outside [0, 10000]")]
    ScoreOutOfRange { score: u32 },

    /// [ACSE-VERIFY-006] Request not found
    #[error("[ACSE-VERIFY-006] Verification request {request_id} not found")]
    RequestNotFound { request_id: String },

    /// [ACSE-VERIFY-007] Asset already has an open request
    #[error("[ACSE-VERIFY-007] Asset {asset_id} already has open request {request_id}")]
    VerificationInProgress { asset_id: String, request_id: String },

    /// [ACSE-VERIFY-008] Request is not awaiting manual review
    #[error("[ACSE-VERIFY-008] Request {request_id} is not awaiting review")]
    ReviewNotPending { request_id: String },

    /// [ACSE-VERIFY-009] Evidence references invalid
    #[error("[ACSE-VERIFY-009] Invalid evidence: {reason}")]
    InvalidEvidence { reason: String },

    // ============================================================
    // Valuation Errors (ACSE-VALUATION-*)
    // ============================================================
    /// [ACSE-VALUATION-001] Buffered valuation fails freshness/volatility check
    #[error("[ACSE-VALUATION-001] Price for asset {asset_id} is stale: {reason}")]
    PriceStale { asset_id: String, reason: String },

    /// [ACSE-VALUATION-002] Sample rejected
    #[error("[ACSE-VALUATION-002] Invalid price sample: {reason}")]
    InvalidSample { reason: String },

    // ============================================================
    // Settlement Errors (ACSE-SETTLE-*)
    // ============================================================
    /// [ACSE-SETTLE-001] Asset not verified at creation time
    #[error("[ACSE-SETTLE-001] Asset {asset_id} is not verified")]
    AssetNotVerified { asset_id: String },

    /// [ACSE-SETTLE-002] Settlement already funded
    #[error("[ACSE-SETTLE-002] Settlement {settlement_id} already funded")]
    AlreadyFunded { settlement_id: String },

    /// [ACSE-SETTLE-003] Settlement not funded
    #[error("[ACSE-SETTLE-003] Settlement {settlement_id} is not funded")]
    NotFunded { settlement_id: String },

    /// [ACSE-SETTLE-004] Settlement past its deadline
    #[error("[ACSE-SETTLE-004] Settlement {settlement_id} has expired")]
    Expired { settlement_id: String },

    /// [ACSE-SETTLE-005] Settlement not found
    #[error("[ACSE-SETTLE-005] Settlement {settlement_id} not found")]
    SettlementNotFound { settlement_id: String },

    /// [ACSE-SETTLE-006] Settlement in a terminal status
    #[error("[ACSE-SETTLE-006] Settlement {settlement_id} is closed ({status})")]
    SettlementClosed {
        settlement_id: String,
        status: String,
    },

    /// [ACSE-SETTLE-007] Settlement under dispute
    #[error("[ACSE-SETTLE-007] Settlement {settlement_id} is under dispute")]
    SettlementDisputed { settlement_id: String },

    /// [ACSE-SETTLE-008] A funds transfer for this settlement is in flight
    #[error("[ACSE-SETTLE-008] Settlement {settlement_id} has a transfer in flight")]
    TransferInFlight { settlement_id: String },

    /// [ACSE-SETTLE-009] Settlement parameters invalid
    #[error("[ACSE-SETTLE-009] Invalid settlement: {reason}")]
    InvalidSettlement { reason: String },

    /// [ACSE-SETTLE-010] Settlement is not disputed
    #[error("[ACSE-SETTLE-010] Settlement {settlement_id} is not disputed")]
    NotDisputed { settlement_id: String },

    // ============================================================
    // Collaborator Errors (ACSE-COLLAB-*)
    // ============================================================
    /// [ACSE-COLLAB-001] Collaborator call timed out
    #[error("[ACSE-COLLAB-001] {collaborator} timed out after {timeout_ms}ms")]
    CollaboratorTimeout {
        collaborator: String,
        timeout_ms: u64,
    },

    /// [ACSE-COLLAB-002] Collaborator call failed
    #[error("[ACSE-COLLAB-002] {collaborator} failed: {reason}")]
    CollaboratorFailed {
        collaborator: String,
        reason: String,
    },

    /// [ACSE-COLLAB-003] Asset unknown to the registry
    #[error("[ACSE-COLLAB-003] Asset {asset_id} not found in registry")]
    AssetNotFound { asset_id: String },

    // ============================================================
    // General Errors
    // ============================================================
    /// [ACSE-STORE-001] Persistence failure
    #[error("[ACSE-STORE-001] Storage error: {0}")]
    Storage(String),

    /// Invalid amount
    #[error("Invalid amount: {reason}")]
    InvalidAmount { reason: String },

    /// [ACSE-FATAL-001] Invariant violation
    #[error("[ACSE-FATAL-001] Invariant violation: {invariant} - {details}")]
    InvariantViolation { invariant: String, details: String },
}

/// Stable, transport-independent error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InsufficientStake,
    DuplicateIdentity,
    AttestorNotFound,
    ViolationAlreadySlashed,
    PolicyNotFound,
    InvalidPolicy,
    Unauthorized,
    InsufficientAttestors,
    NotAssigned,
    AlreadyAttested,
    RequestClosed,
    ScoreOutOfRange,
    NotFound,
    VerificationInProgress,
    ReviewNotPending,
    InvalidEvidence,
    PriceStale,
    InvalidSample,
    AssetNotVerified,
    AlreadyFunded,
    NotFunded,
    Expired,
    SettlementClosed,
    SettlementDisputed,
    TransferInFlight,
    InvalidSettlement,
    NotDisputed,
    CollaboratorTimeout,
    CollaboratorFailed,
    AssetNotFound,
    Storage,
    InvalidAmount,
    Internal,
}

/// Error taxonomy used to decide retry behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad input shape or range, no state change
    Validation,
    /// Rejected before any mutable state was read
    Authorization,
    /// Caller raced a transition; re-read before retrying
    StateConflict,
    /// Referenced entity does not exist
    NotFound,
    /// External collaborator or storage failure, retryable
    Collaborator,
    /// Invariant violation, unrecoverable
    Fatal,
}

impl AcseError {
    /// Stable kind for programmatic branching
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InsufficientStake { .. } => ErrorKind::InsufficientStake,
            Self::DuplicateIdentity { .. } => ErrorKind::DuplicateIdentity,
            Self::AttestorNotFound { .. } => ErrorKind::AttestorNotFound,
            Self::ViolationAlreadySlashed { .. } => ErrorKind::ViolationAlreadySlashed,
            Self::PolicyNotFound { .. } => ErrorKind::PolicyNotFound,
            Self::InvalidPolicy { .. } => ErrorKind::InvalidPolicy,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::InsufficientAttestors { .. } => ErrorKind::InsufficientAttestors,
            Self::NotAssigned { .. } => ErrorKind::NotAssigned,
            Self::AlreadyAttested { .. } => ErrorKind::AlreadyAttested,
            Self::RequestClosed { .. } => ErrorKind::RequestClosed,
            Self::ScoreOutOfRange { .. } => ErrorKind::ScoreOutOfRange,
            Self::RequestNotFound { .. } => ErrorKind::NotFound,
            Self::VerificationInProgress { .. } => ErrorKind::VerificationInProgress,
            Self::ReviewNotPending { .. } => ErrorKind::ReviewNotPending,
            Self::InvalidEvidence { .. } => ErrorKind::InvalidEvidence,
            Self::PriceStale { .. } => ErrorKind::PriceStale,
            Self::InvalidSample { .. } => ErrorKind::InvalidSample,
            Self::AssetNotVerified { .. } => ErrorKind::AssetNotVerified,
            Self::AlreadyFunded { .. } => ErrorKind::AlreadyFunded,
            Self::NotFunded { .. } => ErrorKind::NotFunded,
            Self::Expired { .. } => ErrorKind::Expired,
            Self::SettlementNotFound { .. } => ErrorKind::NotFound,
            Self::SettlementClosed { .. } => ErrorKind::SettlementClosed,
            Self::SettlementDisputed { .. } => ErrorKind::SettlementDisputed,
            Self::TransferInFlight { .. } => ErrorKind::TransferInFlight,
            Self::InvalidSettlement { .. } => ErrorKind::InvalidSettlement,
            Self::NotDisputed { .. } => ErrorKind::NotDisputed,
            Self::CollaboratorTimeout { .. } => ErrorKind::CollaboratorTimeout,
            Self::CollaboratorFailed { .. } => ErrorKind::CollaboratorFailed,
            Self::AssetNotFound { .. } => ErrorKind::AssetNotFound,
            Self::Storage(_) => ErrorKind::Storage,
            Self::InvalidAmount { .. } => ErrorKind::InvalidAmount,
            Self::InvariantViolation { .. } => ErrorKind::Internal,
        }
    }

    /// Taxonomy class of this error
    pub fn class(&self) -> ErrorClass {
        match self.kind() {
            ErrorKind::InsufficientStake
            | ErrorKind::InvalidPolicy
            | ErrorKind::ScoreOutOfRange
            | ErrorKind::InvalidEvidence
            | ErrorKind::InvalidSample
            | ErrorKind::InvalidSettlement
            | ErrorKind::InvalidAmount => ErrorClass::Validation,
            ErrorKind::Unauthorized => ErrorClass::Authorization,
            ErrorKind::AttestorNotFound
            | ErrorKind::PolicyNotFound
            | ErrorKind::NotFound
            | ErrorKind::AssetNotFound => ErrorClass::NotFound,
            ErrorKind::CollaboratorTimeout
            | ErrorKind::CollaboratorFailed
            | ErrorKind::Storage => ErrorClass::Collaborator,
            ErrorKind::Internal => ErrorClass::Fatal,
            _ => ErrorClass::StateConflict,
        }
    }

    /// Whether the caller may retry the same call unchanged
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Collaborator
    }

    /// Registry code, e.g. `ACSE-VERIFY-004`
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientStake { .. } => "ACSE-ATTESTOR-001",
            Self::DuplicateIdentity { .. } => "ACSE-ATTESTOR-002",
            Self::AttestorNotFound { .. } => "ACSE-ATTESTOR-003",
            Self::ViolationAlreadySlashed { .. } => "ACSE-ATTESTOR-004",
            Self::PolicyNotFound { .. } => "ACSE-POLICY-001",
            Self::InvalidPolicy { .. } => "ACSE-POLICY-002",
            Self::Unauthorized { .. } => "ACSE-AUTH-001",
            Self::InsufficientAttestors { .. } => "ACSE-VERIFY-001",
            Self::NotAssigned { .. } => "ACSE-VERIFY-002",
            Self::AlreadyAttested { .. } => "ACSE-VERIFY-003",
            Self::RequestClosed { .. } => "ACSE-VERIFY-004",
            Self::ScoreOutOfRange { .. } => "ACSE-VERIFY-005",
            Self::RequestNotFound { .. } => "ACSE-VERIFY-006",
            Self::VerificationInProgress { .. } => "ACSE-VERIFY-007",
            Self::ReviewNotPending { .. } => "ACSE-VERIFY-008",
            Self::InvalidEvidence { .. } => "ACSE-VERIFY-009",
            Self::PriceStale { .. } => "ACSE-VALUATION-001",
            Self::InvalidSample { .. } => "ACSE-VALUATION-002",
            Self::AssetNotVerified { .. } => "ACSE-SETTLE-001",
            Self::AlreadyFunded { .. } => "ACSE-SETTLE-002",
            Self::NotFunded { .. } => "ACSE-SETTLE-003",
            Self::Expired { .. } => "ACSE-SETTLE-004",
            Self::SettlementNotFound { .. } => "ACSE-SETTLE-005",
            Self::SettlementClosed { .. } => "ACSE-SETTLE-006",
            Self::SettlementDisputed { .. } => "ACSE-SETTLE-007",
            Self::TransferInFlight { .. } => "ACSE-SETTLE-008",
            Self::InvalidSettlement { .. } => "ACSE-SETTLE-009",
            Self::NotDisputed { .. } => "ACSE-SETTLE-010",
            Self::CollaboratorTimeout { .. } => "ACSE-COLLAB-001",
            Self::CollaboratorFailed { .. } => "ACSE-COLLAB-002",
            Self::AssetNotFound { .. } => "ACSE-COLLAB-003",
            Self::Storage(_) => "ACSE-STORE-001",
            Self::InvalidAmount { .. } => "ACSE-GEN-001",
            Self::InvariantViolation { .. } => "ACSE-FATAL-001",
        }
    }

    /// Shorthand for an invariant violation
    pub fn invariant(invariant: impl Into<String>, details: impl Into<String>) -> Self {
        Self::InvariantViolation {
            invariant: invariant.into(),
            details: details.into(),
        }
    }
}

impl From<serde_json::Error> for AcseError {
    fn from(err: serde_json::Error) -> Self {
        AcseError::Storage(format!("serialization: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_carries_code() {
        let err = AcseError::RequestClosed {
            request_id: "req:1".to_string(),
            status: "EXPIRED".to_string(),
        };
        assert!(err.to_string().starts_with("[ACSE-VERIFY-004]"));
        assert_eq!(err.code(), "ACSE-VERIFY-004");
    }

    #[test]
    fn test_kind_is_independent_of_message() {
        let a = AcseError::RequestNotFound {
            request_id: "a".to_string(),
        };
        let b = AcseError::SettlementNotFound {
            settlement_id: "b".to_string(),
        };
        assert_eq!(a.kind(), ErrorKind::NotFound);
        assert_eq!(b.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_classes() {
        assert_eq!(
            AcseError::ScoreOutOfRange { score: 10001 }.class(),
            ErrorClass::Validation
        );
        assert_eq!(
            AcseError::Unauthorized {
                caller: "x".into(),
                action: "set_policy".into()
            }
            .class(),
            ErrorClass::Authorization
        );
        assert_eq!(
            AcseError::AlreadyFunded {
                settlement_id: "s".into()
            }
            .class(),
            ErrorClass::StateConflict
        );
        assert_eq!(
            AcseError::invariant("attestation count", "3 > 2").class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_only_collaborator_errors_retry() {
        assert!(AcseError::CollaboratorTimeout {
            collaborator: "funds_rail".into(),
            timeout_ms: 5000
        }
        .is_retryable());
        assert!(AcseError::Storage("io".into()).is_retryable());
        assert!(!AcseError::PriceStale {
            asset_id: "a".into(),
            reason: "r".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_kind_serializes_stably() {
        let json = serde_json::to_string(&ErrorKind::AlreadyAttested).unwrap();
        assert_eq!(json, "\"ALREADY_ATTESTED\"");
    }
}
