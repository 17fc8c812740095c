//! # Uptane Core
//!
//! Canonical data structures, serialization, and cryptographic primitives for
//! TUF/Uptane update metadata served to robots.
//!
//! ## Key Features
//! - **Canonical JSON**: Deterministic bytes for hashing and signing
//! - **RSASSA-PSS signatures**: Base64-encoded, keyed by SPKI digest
//! - **Metadata engine**: Root, targets, snapshot and timestamp generation
//! - **Manifest wire types**: Robot version reports and ECU registration

pub mod canonical;
pub mod crypto;
pub mod manifest;
pub mod metadata;
pub mod types;

pub use canonical::{canonicalize, to_canonical_json, CanonicalError};
pub use crypto::{CryptoError, HashAlgorithm, KeyType, PublicKey, SignatureMethod, Signer};
pub use manifest::{EcuRegistrationRequest, ParsedManifest, RobotManifest};
pub use metadata::{
    Metadata, MetadataError, RootMetadata, Signed, SnapshotMetadata, TargetBuilder, TargetEntry,
    TargetsMetadata, TimestampMetadata,
};
pub use types::*;

#[cfg(test)]
mod tests {
    #[test]
    fn test_version() {
        assert_eq!(env!("CARGO_PKG_VERSION"), "0.1.0");
    }
}
