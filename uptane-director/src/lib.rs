//! # Uptane Director
//!
//! Director side of the robot update service: signs and versions the image
//! and director repositories, verifies robot manifests and drives rollouts.
//!
//! ## Key Features
//! - **Atomic metadata chains**: targets, snapshot and timestamp commit together
//! - **Manifest verification**: ordered checks with replay protection
//! - **Rollouts**: per-robot director targets correlated with telemetry
//! - **Re-signing**: periodic refresh of documents close to expiry

pub mod chain;
pub mod config;
pub mod custody;
pub mod director;
pub mod error;
pub mod events;
pub mod inventory;
pub mod manifest;
pub mod resigner;
pub mod rollout;
pub mod store;
pub mod worker;

pub use chain::ChainWriter;
pub use config::Config;
pub use custody::{
    CertificateAuthority, CustodyError, InMemoryCertificateAuthority, InMemoryKeyStorage, KeyId, KeyPair,
    KeyStorage,
};
pub use director::{Backends, Director};
pub use error::{DirectorError, Result};
pub use events::{channel, AuditSink, Event, EventPublisher, EventSubscriber, TelemetryEvent, TracingAuditSink};
pub use inventory::{InMemoryInventory, InventoryStore};
pub use manifest::{ManifestError, ManifestOutcome, ManifestPipeline};
pub use resigner::Resigner;
pub use rollout::{RolloutEngine, RolloutTargets};
pub use store::{InMemoryMetadataStore, MetadataKey, MetadataStore, StoreError, WriteUnit};
pub use worker::EventDispatcher;

/// Actor id recorded on audit events the service raises itself.
pub const SERVICE_ACTOR: &str = "uptane-director";
