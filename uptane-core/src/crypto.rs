//! Cryptographic primitives for metadata and manifest signatures.
//!
//! Only RSA keys are supported: signatures are RSASSA-PSS over SHA-256 with a
//! salt as long as the digest, and travel base64-encoded.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::pss;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use thiserror::Error;

/// Default modulus size for generated keys.
pub const DEFAULT_KEY_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Signing failed: {0}")]
    Signing(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Hash digests used in target and meta entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

/// Compute a hex digest of `data`.
pub fn hash(data: &[u8], algorithm: HashAlgorithm) -> String {
    match algorithm {
        HashAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
        HashAlgorithm::Sha512 => hex::encode(Sha512::digest(data)),
    }
}

/// Compute the hex SHA-256 digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hash(data, HashAlgorithm::Sha256)
}

/// Key types named in TUF key objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    #[serde(rename = "RSA", alias = "rsa")]
    Rsa,
    #[serde(rename = "ED25519", alias = "ed25519")]
    Ed25519,
    #[serde(rename = "ecdsa-sha2-nistp256")]
    EcdsaP256,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Rsa => write!(f, "RSA"),
            KeyType::Ed25519 => write!(f, "ED25519"),
            KeyType::EcdsaP256 => write!(f, "ecdsa-sha2-nistp256"),
        }
    }
}

/// Signature schemes as they appear in `signatures[].method`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureMethod {
    #[serde(rename = "rsassa-pss-sha256")]
    RsassaPssSha256,
    /// Sent by aktualizr for RSA keys; same scheme as `rsassa-pss-sha256`.
    #[serde(rename = "rsassa-pss")]
    RsassaPss,
}

/// Public half of a key, with its TUF key id.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    key: RsaPublicKey,
    pem: String,
    key_id: String,
}

impl PublicKey {
    /// Parse a PEM public key (SubjectPublicKeyInfo, or PKCS#1 `RSA PUBLIC KEY`).
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Self::from_rsa(key)
    }

    fn from_rsa(key: RsaPublicKey) -> Result<Self> {
        let der = key
            .to_public_key_der()
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        let pem = key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

        Ok(Self {
            key_id: sha256_hex(der.as_bytes()),
            key,
            pem,
        })
    }

    /// `hex(SHA-256(DER(SubjectPublicKeyInfo)))`
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn to_pem(&self) -> &str {
        &self.pem
    }

    pub fn key_type(&self) -> KeyType {
        KeyType::Rsa
    }

    /// Verify a base64 signature over `message`.
    ///
    /// Malformed encodings and wrong-length signatures yield `false`.
    pub fn verify(&self, message: &[u8], signature_b64: &str) -> bool {
        let Ok(raw) = BASE64.decode(signature_b64.trim()) else {
            return false;
        };
        let Ok(signature) = pss::Signature::try_from(raw.as_slice()) else {
            return false;
        };
        let verifying_key = pss::VerifyingKey::<Sha256>::new(self.key.clone());
        verifying_key.verify(message, &signature).is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey").field("key_id", &self.key_id).finish()
    }
}

/// A signer holding an RSA private key.
pub struct Signer {
    signing_key: RsaPrivateKey,
    public_key: PublicKey,
}

impl Signer {
    /// Create a new signer from a private key.
    pub fn new(signing_key: RsaPrivateKey) -> Result<Self> {
        let public_key = PublicKey::from_rsa(signing_key.to_public_key())?;
        Ok(Self {
            signing_key,
            public_key,
        })
    }

    /// Generate a new random key of the default size.
    pub fn generate() -> Result<Self> {
        Self::generate_with_bits(DEFAULT_KEY_BITS)
    }

    /// Generate a new random key with a `bits`-sized modulus.
    pub fn generate_with_bits(bits: usize) -> Result<Self> {
        let mut csprng = OsRng;
        let signing_key = RsaPrivateKey::new(&mut csprng, bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Self::new(signing_key)
    }

    /// Parse a PKCS#8 PEM private key.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let signing_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        Self::new(signing_key)
    }

    /// Parse a PEM private key declared as `key_type`.
    pub fn from_pem_typed(pem: &str, key_type: KeyType) -> Result<Self> {
        match key_type {
            KeyType::Rsa => Self::from_pem(pem),
            other => Err(CryptoError::UnsupportedKeyType(other.to_string())),
        }
    }

    /// Encode the private key as PKCS#8 PEM (for custody).
    pub fn private_key_pem(&self) -> Result<String> {
        self.signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))
    }

    /// Sign a message, returning the base64 signature.
    pub fn sign(&self, message: &[u8]) -> Result<String> {
        let signing_key = pss::SigningKey::<Sha256>::new(self.signing_key.clone());
        let signature = signing_key
            .try_sign_with_rng(&mut OsRng, message)
            .map_err(|e| CryptoError::Signing(e.to_string()))?;
        Ok(BASE64.encode(signature.to_bytes()))
    }

    /// Get the public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn key_id(&self) -> &str {
        self.public_key.key_id()
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("key_id", &self.public_key.key_id)
            .finish_non_exhaustive()
    }
}

/// Sign `message` with a PEM private key of the given type.
pub fn sign(message: &[u8], private_key_pem: &str, key_type: KeyType) -> Result<String> {
    Signer::from_pem_typed(private_key_pem, key_type)?.sign(message)
}

/// Verify a base64 signature with a PEM public key. Never errors.
pub fn verify(message: &[u8], signature_b64: &str, public_key_pem: &str) -> bool {
    PublicKey::from_pem(public_key_pem)
        .map(|key| key.verify(message, signature_b64))
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod test_keys {
    use super::Signer;
    use std::sync::OnceLock;

    /// Small keys shared by every test in the crate; generation dominates test time otherwise.
    pub fn signer(index: usize) -> &'static Signer {
        static KEYS: OnceLock<Vec<Signer>> = OnceLock::new();
        &KEYS.get_or_init(|| {
            (0..4)
                .map(|_| Signer::generate_with_bits(1024).unwrap())
                .collect()
        })[index]
    }
}

#[cfg(test)]
mod tests {
    use super::test_keys::signer;
    use super::*;

    #[test]
    fn test_sha256() {
        let hash1 = sha256_hex(b"test data");
        let hash2 = sha256_hex(b"test data");
        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_sha512() {
        assert_eq!(hash(b"x", HashAlgorithm::Sha512).len(), 128);
    }

    #[test]
    fn test_sign_and_verify() {
        let key = signer(0);
        let signature = key.sign(b"test message").unwrap();

        assert!(key.public_key().verify(b"test message", &signature));
        assert!(!key.public_key().verify(b"other message", &signature));
        assert!(!signer(1).public_key().verify(b"test message", &signature));
    }

    #[test]
    fn test_verify_malformed_is_false() {
        let key = signer(0).public_key();
        assert!(!key.verify(b"m", "not base64 !!"));
        assert!(!key.verify(b"m", ""));
        assert!(!key.verify(b"m", &BASE64.encode([1u8; 7])));
        assert!(!verify(b"m", "AAAA", "not a pem"));
    }

    #[test]
    fn test_pem_round_trip_keeps_key_id() {
        let key = signer(2);
        let reparsed = PublicKey::from_pem(key.public_key().to_pem()).unwrap();
        assert_eq!(reparsed.key_id(), key.key_id());

        let private = key.private_key_pem().unwrap();
        let restored = Signer::from_pem(&private).unwrap();
        assert_eq!(restored.key_id(), key.key_id());

        let signature = sign(b"payload", &private, KeyType::Rsa).unwrap();
        assert!(verify(b"payload", &signature, key.public_key().to_pem()));
    }

    #[test]
    fn test_unsupported_key_type() {
        let private = signer(0).private_key_pem().unwrap();
        assert!(matches!(
            sign(b"payload", &private, KeyType::Ed25519),
            Err(CryptoError::UnsupportedKeyType(_))
        ));
    }

    #[test]
    fn test_key_type_wire_form() {
        assert_eq!(serde_json::to_string(&KeyType::Rsa).unwrap(), "\"RSA\"");
        assert_eq!(serde_json::from_str::<KeyType>("\"rsa\"").unwrap(), KeyType::Rsa);
        assert_eq!(
            serde_json::from_str::<SignatureMethod>("\"rsassa-pss\"").unwrap(),
            SignatureMethod::RsassaPss
        );
    }
}
