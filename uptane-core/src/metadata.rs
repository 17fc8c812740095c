//! TUF metadata documents and the functions that generate them.
//!
//! Every document has the shape `{signatures: [...], signed: {...}}` and is
//! signed over the canonical JSON of `signed`. Generation is pure apart from
//! signing: callers decide the version (latest + 1) and persist the result.
//!
//! ## Referential Integrity
//! Snapshot metadata pins the targets document it describes, and timestamp
//! metadata pins the snapshot, by version, length and SHA-256 of the canonical
//! bytes of the *whole* referenced document.

use crate::canonical::{canonicalize, to_canonical_json, CanonicalError};
use crate::crypto::{sha256_hex, CryptoError, KeyType, PublicKey, SignatureMethod, Signer};
use crate::types::{tuf_datetime, EcuSerial, HardwareId, Role, Ttl};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Canonicalization failed: {0}")]
    Canonical(#[from] CanonicalError),

    #[error("Signing failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Malformed metadata: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Expected {expected} metadata, found {found}")]
    WrongRole { expected: Role, found: Role },

    #[error("No key for role {0} in root metadata")]
    MissingRoleKey(Role),

    #[error("{file} reference mismatch: {reason}")]
    ReferenceMismatch { file: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, MetadataError>;

/// A single signature over the canonical `signed` portion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub keyid: String,
    pub method: SignatureMethod,
    pub sig: String,
}

/// A signed metadata envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signed<T> {
    pub signatures: Vec<Signature>,
    pub signed: T,
}

impl<T: Serialize> Signed<T> {
    /// Sign `signed` with a single key.
    pub fn sign(signed: T, signer: &Signer) -> Result<Self> {
        let message = to_canonical_json(&signed)?;
        let sig = signer.sign(&message)?;

        Ok(Self {
            signatures: vec![Signature {
                keyid: signer.key_id().to_string(),
                method: SignatureMethod::RsassaPssSha256,
                sig,
            }],
            signed,
        })
    }

    /// True if a signature attributed to `key` verifies.
    pub fn verify(&self, key: &PublicKey) -> bool {
        let Ok(message) = to_canonical_json(&self.signed) else {
            return false;
        };
        self.signatures
            .iter()
            .filter(|s| s.keyid == key.key_id())
            .any(|s| key.verify(&message, &s.sig))
    }

    /// Canonical bytes of the whole document, as hashed by referencing roles.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(to_canonical_json(self)?)
    }
}

/// Public key object embedded in root metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TufKey {
    pub keytype: KeyType,
    pub keyval: KeyValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub public: String,
}

impl TufKey {
    pub fn from_public_key(key: &PublicKey) -> Self {
        Self {
            keytype: key.key_type(),
            keyval: KeyValue {
                public: key.to_pem().to_string(),
            },
        }
    }

    pub fn public_key(&self) -> std::result::Result<PublicKey, CryptoError> {
        match self.keytype {
            KeyType::Rsa => PublicKey::from_pem(&self.keyval.public),
            other => Err(CryptoError::UnsupportedKeyType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleKeys {
    pub keyids: Vec<String>,
    pub threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootSigned {
    #[serde(rename = "_type")]
    pub role: Role,
    pub consistent_snapshot: bool,
    #[serde(with = "tuf_datetime")]
    pub expires: DateTime<Utc>,
    pub version: u64,
    pub keys: BTreeMap<String, TufKey>,
    pub roles: BTreeMap<String, RoleKeys>,
}

impl RootSigned {
    /// The first key delegated to `role`.
    pub fn role_key(&self, role: Role) -> Result<PublicKey> {
        let key = self
            .roles
            .get(role.as_str())
            .and_then(|r| r.keyids.first())
            .and_then(|id| self.keys.get(id))
            .ok_or(MetadataError::MissingRoleKey(role))?;
        Ok(key.public_key()?)
    }
}

/// Director targets carry the rollout association they were generated for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetsCustom {
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetsSigned {
    #[serde(rename = "_type")]
    pub role: Role,
    #[serde(with = "tuf_datetime")]
    pub expires: DateTime<Utc>,
    pub version: u64,
    pub targets: BTreeMap<String, TargetEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<TargetsCustom>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hashes {
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha512: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetFormat {
    Binary,
    Ostree,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcuIdentifier {
    #[serde(rename = "hardwareId")]
    pub hardware_id: HardwareId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetCustom {
    #[serde(rename = "ecuIdentifiers", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ecu_identifiers: BTreeMap<EcuSerial, EcuIdentifier>,
    #[serde(rename = "targetFormat")]
    pub target_format: TargetFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetEntry {
    pub length: u64,
    pub hashes: Hashes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<TargetCustom>,
}

impl TargetEntry {
    /// Whether this entry assigns the target to `serial`.
    pub fn is_for_ecu(&self, serial: &EcuSerial) -> bool {
        self.custom
            .as_ref()
            .is_some_and(|c| c.ecu_identifiers.contains_key(serial))
    }
}

/// Version, length and hash of a referenced metadata file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaFile {
    pub version: u64,
    pub length: u64,
    pub hashes: Hashes,
}

impl MetaFile {
    /// Describe a signed document as it would be served.
    pub fn describe<T: Serialize>(doc: &Signed<T>, version: u64) -> Result<Self> {
        let bytes = doc.canonical_bytes()?;
        Ok(Self {
            version,
            length: bytes.len() as u64,
            hashes: Hashes {
                sha256: sha256_hex(&bytes),
                sha512: None,
            },
        })
    }

    fn check<T: Serialize>(&self, file: &'static str, doc: &Signed<T>, version: u64) -> Result<()> {
        let actual = Self::describe(doc, version)?;
        let mismatch = |reason: String| MetadataError::ReferenceMismatch { file, reason };

        if self.version != actual.version {
            return Err(mismatch(format!(
                "version {} != {}",
                self.version, actual.version
            )));
        }
        if self.length != actual.length {
            return Err(mismatch(format!("length {} != {}", self.length, actual.length)));
        }
        if self.hashes.sha256 != actual.hashes.sha256 {
            return Err(mismatch("sha256 differs".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSigned {
    #[serde(rename = "_type")]
    pub role: Role,
    #[serde(with = "tuf_datetime")]
    pub expires: DateTime<Utc>,
    pub version: u64,
    pub meta: BTreeMap<String, MetaFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampSigned {
    #[serde(rename = "_type")]
    pub role: Role,
    #[serde(with = "tuf_datetime")]
    pub expires: DateTime<Utc>,
    pub version: u64,
    pub meta: BTreeMap<String, MetaFile>,
}

pub type RootMetadata = Signed<RootSigned>;
pub type TargetsMetadata = Signed<TargetsSigned>;
pub type SnapshotMetadata = Signed<SnapshotSigned>;
pub type TimestampMetadata = Signed<TimestampSigned>;

/// Any top-level metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Metadata {
    Root(RootMetadata),
    Targets(TargetsMetadata),
    Snapshot(SnapshotMetadata),
    Timestamp(TimestampMetadata),
}

impl Metadata {
    pub fn role(&self) -> Role {
        match self {
            Metadata::Root(_) => Role::Root,
            Metadata::Targets(_) => Role::Targets,
            Metadata::Snapshot(_) => Role::Snapshot,
            Metadata::Timestamp(_) => Role::Timestamp,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Metadata::Root(m) => m.signed.version,
            Metadata::Targets(m) => m.signed.version,
            Metadata::Snapshot(m) => m.signed.version,
            Metadata::Timestamp(m) => m.signed.version,
        }
    }

    pub fn expires(&self) -> DateTime<Utc> {
        match self {
            Metadata::Root(m) => m.signed.expires,
            Metadata::Targets(m) => m.signed.expires,
            Metadata::Snapshot(m) => m.signed.expires,
            Metadata::Timestamp(m) => m.signed.expires,
        }
    }

    /// Expired, or expiring within `window` of `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.expires() <= now + window
    }

    pub fn as_root(&self) -> Option<&RootMetadata> {
        match self {
            Metadata::Root(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_targets(&self) -> Option<&TargetsMetadata> {
        match self {
            Metadata::Targets(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_snapshot(&self) -> Option<&SnapshotMetadata> {
        match self {
            Metadata::Snapshot(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<&TimestampMetadata> {
        match self {
            Metadata::Timestamp(m) => Some(m),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(canonicalize(&self.to_value()?)?)
    }

    /// Parse a document, dispatching on `signed._type`.
    pub fn from_value(value: Value) -> Result<Self> {
        let role: Role = serde_json::from_value(
            value
                .pointer("/signed/_type")
                .cloned()
                .ok_or(MetadataError::MissingField("signed._type"))?,
        )?;

        Ok(match role {
            Role::Root => Metadata::Root(serde_json::from_value(value)?),
            Role::Targets => Metadata::Targets(serde_json::from_value(value)?),
            Role::Snapshot => Metadata::Snapshot(serde_json::from_value(value)?),
            Role::Timestamp => Metadata::Timestamp(serde_json::from_value(value)?),
        })
    }
}

impl<'de> Deserialize<'de> for Metadata {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Metadata::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// Generate root metadata delegating each top-level role to a single key.
///
/// Root is always signed by the root key, including on re-signing.
pub fn generate_root(
    ttl: Ttl,
    version: u64,
    consistent_snapshot: bool,
    root_key: &Signer,
    targets_key: &PublicKey,
    snapshot_key: &PublicKey,
    timestamp_key: &PublicKey,
) -> Result<RootMetadata> {
    let delegations = [
        (Role::Root, root_key.public_key()),
        (Role::Targets, targets_key),
        (Role::Snapshot, snapshot_key),
        (Role::Timestamp, timestamp_key),
    ];

    let mut keys = BTreeMap::new();
    let mut roles = BTreeMap::new();
    for (role, key) in delegations {
        keys.insert(key.key_id().to_string(), TufKey::from_public_key(key));
        roles.insert(
            role.as_str().to_string(),
            RoleKeys {
                keyids: vec![key.key_id().to_string()],
                threshold: 1,
            },
        );
    }

    let signed = RootSigned {
        role: Role::Root,
        consistent_snapshot,
        expires: ttl.expiry_from_now(),
        version,
        keys,
        roles,
    };
    Signed::sign(signed, root_key)
}

/// Generate targets metadata listing `targets`.
pub fn generate_targets(
    ttl: Ttl,
    version: u64,
    targets_key: &Signer,
    targets: BTreeMap<String, TargetEntry>,
    custom: Option<TargetsCustom>,
) -> Result<TargetsMetadata> {
    let signed = TargetsSigned {
        role: Role::Targets,
        expires: ttl.expiry_from_now(),
        version,
        targets,
        custom,
    };
    Signed::sign(signed, targets_key)
}

/// Generate snapshot metadata pinning `targets`.
pub fn generate_snapshot(
    ttl: Ttl,
    version: u64,
    snapshot_key: &Signer,
    targets: &TargetsMetadata,
) -> Result<SnapshotMetadata> {
    let mut meta = BTreeMap::new();
    meta.insert(
        Role::Targets.filename().to_string(),
        MetaFile::describe(targets, targets.signed.version)?,
    );

    let signed = SnapshotSigned {
        role: Role::Snapshot,
        expires: ttl.expiry_from_now(),
        version,
        meta,
    };
    Signed::sign(signed, snapshot_key)
}

/// Generate timestamp metadata pinning `snapshot`.
pub fn generate_timestamp(
    ttl: Ttl,
    version: u64,
    timestamp_key: &Signer,
    snapshot: &SnapshotMetadata,
) -> Result<TimestampMetadata> {
    let mut meta = BTreeMap::new();
    meta.insert(
        Role::Snapshot.filename().to_string(),
        MetaFile::describe(snapshot, snapshot.signed.version)?,
    );

    let signed = TimestampSigned {
        role: Role::Timestamp,
        expires: ttl.expiry_from_now(),
        version,
        meta,
    };
    Signed::sign(signed, timestamp_key)
}

/// Check that `snapshot` pins exactly this `targets` document.
pub fn verify_snapshot_reference(snapshot: &SnapshotMetadata, targets: &TargetsMetadata) -> Result<()> {
    let file = Role::Targets.filename();
    snapshot
        .signed
        .meta
        .get(file)
        .ok_or(MetadataError::MissingField("meta[targets.json]"))?
        .check(file, targets, targets.signed.version)
}

/// Check that `timestamp` pins exactly this `snapshot` document.
pub fn verify_timestamp_reference(timestamp: &TimestampMetadata, snapshot: &SnapshotMetadata) -> Result<()> {
    let file = Role::Snapshot.filename();
    timestamp
        .signed
        .meta
        .get(file)
        .ok_or(MetadataError::MissingField("meta[snapshot.json]"))?
        .check(file, snapshot, snapshot.signed.version)
}

/// Builder for target entries.
pub struct TargetBuilder {
    length: Option<u64>,
    sha256: Option<String>,
    sha512: Option<String>,
    target_format: TargetFormat,
    uri: Option<String>,
    ecu_identifiers: BTreeMap<EcuSerial, EcuIdentifier>,
}

impl TargetBuilder {
    pub fn new() -> Self {
        Self {
            length: None,
            sha256: None,
            sha512: None,
            target_format: TargetFormat::Binary,
            uri: None,
            ecu_identifiers: BTreeMap::new(),
        }
    }

    pub fn length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }

    pub fn sha256(mut self, hash: impl Into<String>) -> Self {
        self.sha256 = Some(hash.into());
        self
    }

    pub fn sha512(mut self, hash: Option<String>) -> Self {
        self.sha512 = hash;
        self
    }

    pub fn format(mut self, format: TargetFormat) -> Self {
        self.target_format = format;
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Assign the target to an ECU.
    pub fn ecu(mut self, serial: EcuSerial, hardware_id: HardwareId) -> Self {
        self.ecu_identifiers
            .insert(serial, EcuIdentifier { hardware_id });
        self
    }

    pub fn build(self) -> Result<TargetEntry> {
        Ok(TargetEntry {
            length: self.length.ok_or(MetadataError::MissingField("length"))?,
            hashes: Hashes {
                sha256: self.sha256.ok_or(MetadataError::MissingField("sha256"))?,
                sha512: self.sha512,
            },
            custom: Some(TargetCustom {
                ecu_identifiers: self.ecu_identifiers,
                target_format: self.target_format,
                uri: self.uri,
            }),
        })
    }
}

impl Default for TargetBuilder {
    fn default() -> Self {
        Self::new()
    }
}
