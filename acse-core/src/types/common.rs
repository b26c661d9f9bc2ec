//! Basic Types
//!
//! Naming conventions:
//! - `_id` suffix: Primary key identifiers
//! - `_ref` suffix: References to external objects
//! - `_digest` suffix: Cryptographic digests

use crate::error::{AcseError, AcseResult};
use serde::{Deserialize, Serialize};

/// Upper bound for scores and reputation, in basis points
pub const MAX_SCORE: u32 = 10_000;

// ============================================================
// Digest
// ============================================================

/// 32-byte BLAKE3 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// BLAKE3 hash
    pub fn blake3(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create zero digest
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Check if zero
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Create from hex string
    pub fn from_hex(s: &str) -> AcseResult<Self> {
        let bytes = hex::decode(s).map_err(|_| AcseError::InvalidEvidence {
            reason: format!("digest is not hex: {}", s),
        })?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| AcseError::InvalidEvidence {
            reason: "digest must be 32 bytes".to_string(),
        })?;
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({}...)", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Default for Digest {
    fn default() -> Self {
        Self::zero()
    }
}

// ============================================================
// ID Types
// ============================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Fresh random identifier
            pub fn generate() -> Self {
                Self(format!("{}:{}", $prefix, uuid::Uuid::new_v4()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Attestor ID
    AttestorId,
    "att"
);
string_id!(
    /// Verification request ID
    RequestId,
    "req"
);
string_id!(
    /// Asset ID (issued by the asset registry)
    AssetId,
    "asset"
);
string_id!(
    /// Settlement ID
    SettlementId,
    "stl"
);
string_id!(
    /// Party (account) ID used by the funds rail
    PartyId,
    "party"
);
string_id!(
    /// Asset category key, e.g. `AGRICULTURAL`
    CategoryKey,
    "cat"
);

// ============================================================
// Score
// ============================================================

/// Attestation score in basis points, 0..=10000
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Score(u32);

impl Score {
    /// Validate and wrap a raw score
    pub fn new(value: u32) -> AcseResult<Self> {
        if value > MAX_SCORE {
            return Err(AcseError::ScoreOutOfRange { score: value });
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for Score {
    type Error = AcseError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Score::new(value)
    }
}

impl From<Score> for u32 {
    fn from(score: Score) -> Self {
        score.0
    }
}

impl std::fmt::Display for Score {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================
// Evidence
// ============================================================

/// Reference to externally stored evidence. Storage mechanics are opaque here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRef {
    /// Locator understood by the document store
    pub locator: String,
    /// Content digest, if the submitter supplied one
    pub digest: Option<Digest>,
}

impl EvidenceRef {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            digest: None,
        }
    }

    pub fn with_digest(mut self, digest: Digest) -> Self {
        self.digest = Some(digest);
        self
    }
}

/// Validate a submitted evidence list
pub fn validate_evidence(evidence: &[EvidenceRef]) -> AcseResult<()> {
    if evidence.is_empty() {
        return Err(AcseError::InvalidEvidence {
            reason: "at least one evidence reference is required".to_string(),
        });
    }
    if let Some(bad) = evidence.iter().find(|e| e.locator.trim().is_empty()) {
        return Err(AcseError::InvalidEvidence {
            reason: format!("empty locator (digest {:?})", bad.digest),
        });
    }
    Ok(())
}

// ============================================================
// Caller
// ============================================================

/// Roles granted by the identity collaborator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// May set policies
    Governance,
    /// May approve manual-review requests
    Reviewer,
    /// May resolve settlement disputes
    Arbiter,
}

/// Authenticated caller. Authentication happens upstream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub party: PartyId,
    pub roles: Vec<Role>,
}

impl Caller {
    pub fn new(party: impl Into<PartyId>) -> Self {
        Self {
            party: party.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        if !self.roles.contains(&role) {
            self.roles.push(role);
        }
        self
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Fail with `Unauthorized` unless the caller holds `role`
    pub fn require(&self, role: Role, action: &str) -> AcseResult<()> {
        if self.has_role(role) {
            Ok(())
        } else {
            Err(AcseError::Unauthorized {
                caller: self.party.to_string(),
                action: action.to_string(),
            })
        }
    }
}

impl From<&str> for Caller {
    fn from(party: &str) -> Self {
        Caller::new(PartyId::new(party))
    }
}
