//! ACSE Engine - async orchestration
//!
//! Wires the domain core to storage and external collaborators.
//!
//! # Components
//!
//! - **AttestorRegistry**: registration, slashing, stake top-ups, reputation walk
//! - **PolicyStore**: per-category rules behind a lock-free snapshot
//! - **ConsensusEngine**: request lifecycle, attestor selection, finalization
//! - **ValuationBuffer**: rolling oracle windows and the tolerance check
//! - **SettlementEngine**: escrow lifecycle gated on verification and price
//!
//! # Concurrency
//!
//! Mutations are serialized per entity (request, settlement, attestor, asset)
//! with [`locks::EntityLocks`]; there is no global lock. Collaborator calls are
//! made without holding any entity lock and always under a timeout.
//!
//! # Usage
//!
//! ```rust,ignore
//! use acse_engine::{AttestationEngine, EngineConfig};
//!
//! let engine = AttestationEngine::builder(EngineConfig::from_env())
//!     .with_registry_client(registry)
//!     .with_funds_rail(rail)
//!     .build()
//!     .await?;
//! let _sweeper = engine.start_sweeper();
//! ```

pub mod collaborators;
pub mod config;
pub mod consensus;
pub mod engine;
pub mod events;
pub mod locks;
pub mod policy;
pub mod registry;
pub mod settlement;
pub mod sweeper;
pub mod telemetry;
pub mod valuation;

pub use collaborators::{
    AssetDescriptor, CollaboratorError, FundsRail, OracleClient, RegistryClient, TransferReceipt,
};
pub use config::{
    AttestorConfig, ConsensusConfig, EngineConfig, SettlementConfig, ValuationConfig,
};
pub use consensus::{AssetTrust, ConsensusEngine, SweepReport, TrustGate};
pub use engine::{AttestationEngine, EngineBuilder, EngineSweepReport};
pub use events::EventBus;
pub use policy::PolicyStore;
pub use registry::AttestorRegistry;
pub use settlement::{SettlementEngine, SettlementSweepReport};
pub use sweeper::{SweepHandle, SweepRunner};
pub use telemetry::{init_tracing, LogFormat, LogLevel, TelemetryConfig};
pub use valuation::ValuationBuffer;
