//! Key and certificate custody interfaces.
//!
//! Private key material and certificate issuance live behind these traits so
//! the service can run against a secrets manager and an external CA in
//! production, and against the in-memory implementations in tests and local
//! development.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use uptane_core::{EcuSerial, PublicKey, Repo, RobotId, Role, Signer, TeamId};

/// Address of a key pair in storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyId {
    /// Online key of a repository role
    Repo { team: TeamId, repo: Repo, role: Role },
    /// Public key an ECU registered with
    Ecu { team: TeamId, robot: RobotId, ecu: EcuSerial },
    /// Key pair a robot's client certificate was issued for
    Robot { team: TeamId, robot: RobotId },
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyId::Repo { team, repo, role } => write!(f, "{}-{}-{}", team, repo, role),
            KeyId::Ecu { team, robot, ecu } => write!(f, "{}-{}-{}", team, robot, ecu),
            KeyId::Robot { team, robot } => write!(f, "{}-{}", team, robot),
        }
    }
}

/// PEM key material. ECU keys carry a public half only.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub public_key: String,
    pub private_key: Option<String>,
}

impl KeyPair {
    pub fn public_only(public_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            private_key: None,
        }
    }

    /// Export a signer's key material.
    pub fn from_signer(signer: &Signer) -> Result<Self> {
        Ok(Self {
            public_key: signer.public_key().to_pem().to_string(),
            private_key: Some(
                signer
                    .private_key_pem()
                    .map_err(|e| CustodyError::InvalidKey(e.to_string()))?,
            ),
        })
    }

    pub fn public(&self) -> Result<PublicKey> {
        PublicKey::from_pem(&self.public_key).map_err(|e| CustodyError::InvalidKey(e.to_string()))
    }

    pub fn signer(&self) -> Result<Signer> {
        let pem = self
            .private_key
            .as_deref()
            .ok_or_else(|| CustodyError::InvalidKey("no private half".to_string()))?;
        Signer::from_pem(pem).map_err(|e| CustodyError::InvalidKey(e.to_string()))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("has_private_key", &self.private_key.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum CustodyError {
    #[error("Key not found: {0}")]
    KeyNotFound(KeyId),

    #[error("Certificate not found: {0}")]
    CertificateNotFound(String),

    #[error("Certificate {0} not yet issued")]
    Pending(String),

    #[error("Custody backend unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, CustodyError>;

/// Storage for key pairs.
#[async_trait]
pub trait KeyStorage: Send + Sync {
    /// Fetch a key pair, failing with `KeyNotFound` if absent.
    async fn get_key_pair(&self, id: &KeyId) -> Result<KeyPair>;

    /// Store a key pair, replacing any existing one.
    async fn put_key_pair(&self, id: &KeyId, pair: KeyPair) -> Result<()>;

    async fn delete_key_pair(&self, id: &KeyId) -> Result<()>;
}

/// Key storage held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryKeyStorage {
    keys: RwLock<HashMap<KeyId, KeyPair>>,
}

impl InMemoryKeyStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStorage for InMemoryKeyStorage {
    async fn get_key_pair(&self, id: &KeyId) -> Result<KeyPair> {
        self.keys
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CustodyError::KeyNotFound(id.clone()))
    }

    async fn put_key_pair(&self, id: &KeyId, pair: KeyPair) -> Result<()> {
        self.keys.write().await.insert(id.clone(), pair);
        Ok(())
    }

    async fn delete_key_pair(&self, id: &KeyId) -> Result<()> {
        self.keys
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CustodyError::KeyNotFound(id.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateKind {
    /// Client certificate of a robot
    Robot,
    /// Credentials used to provision new robots
    Provisioning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    Issuing,
    Issued,
    Revoked,
    Expired,
}

/// Certificate record kept by the CA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: String,
    pub team: TeamId,
    pub serial: String,
    pub common_name: String,
    pub kind: CertificateKind,
    pub status: CertificateStatus,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub revoked_reason: Option<String>,
}

/// Result of a download attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateDownload {
    Issued { pem: String, serial: String },
    Pending,
}

/// Certificate authority issuing robot and provisioning certificates.
///
/// Issuance is asynchronous: `issue_certificate` returns an id immediately and
/// the certificate becomes downloadable later.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Request a certificate for `subject`.
    ///
    /// # Arguments
    /// * `public_key_pem` - Key the certificate binds to the subject
    /// * `expires_at` - End of the validity period
    ///
    /// # Returns
    /// The id to download the certificate with.
    async fn issue_certificate(
        &self,
        team: &TeamId,
        subject: &str,
        public_key_pem: &str,
        kind: CertificateKind,
        expires_at: DateTime<Utc>,
    ) -> Result<String>;

    async fn download_certificate(&self, team: &TeamId, cert_id: &str) -> Result<CertificateDownload>;

    /// Revoke an issuing or issued certificate. Revoking a certificate that is
    /// already revoked or expired has no effect.
    async fn revoke_certificate(&self, serial: &str, reason: &str) -> Result<()>;

    /// Mark certificates past their expiry as expired, returning how many changed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// PEM of the CA certificate robots trust.
    async fn root_certificate(&self) -> Result<String>;
}

/// Poll a certificate until it is issued.
///
/// Waits `backoff`, `2 * backoff`, `4 * backoff`, ... between attempts and
/// fails with `Pending` once `attempts` downloads have come back pending.
pub async fn await_certificate(
    ca: &dyn CertificateAuthority,
    team: &TeamId,
    cert_id: &str,
    attempts: u32,
    backoff: Duration,
) -> Result<(String, String)> {
    let mut delay = backoff;

    for attempt in 1..=attempts {
        match ca.download_certificate(team, cert_id).await? {
            CertificateDownload::Issued { pem, serial } => return Ok((pem, serial)),
            CertificateDownload::Pending => {
                tracing::debug!(attempt, "certificate not yet issued");
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
            }
        }
    }

    Err(CustodyError::Pending(cert_id.to_string()))
}

#[derive(Debug)]
struct CaRecord {
    certificate: Certificate,
    public_key_pem: String,
    pending_polls: u32,
}

/// Certificate authority held in process memory.
///
/// Certificates become downloadable after `issue_after_polls` pending
/// downloads. Certificate bodies are stand-in PEM blocks carrying the
/// certificate record, not DER X.509.
#[derive(Debug)]
pub struct InMemoryCertificateAuthority {
    certificates: RwLock<HashMap<String, CaRecord>>,
    issue_after_polls: u32,
}

impl InMemoryCertificateAuthority {
    pub fn new() -> Self {
        Self::with_issue_delay(1)
    }

    pub fn with_issue_delay(issue_after_polls: u32) -> Self {
        Self {
            certificates: RwLock::new(HashMap::new()),
            issue_after_polls,
        }
    }

    /// All certificates issued to `team`.
    pub async fn certificates(&self, team: &TeamId) -> Vec<Certificate> {
        self.certificates
            .read()
            .await
            .values()
            .filter(|r| &r.certificate.team == team)
            .map(|r| r.certificate.clone())
            .collect()
    }

    fn pem_block(label: &str, body: &[u8]) -> String {
        let encoded = BASE64.encode(body);
        let mut pem = format!("-----BEGIN {}-----\n", label);
        for line in encoded.as_bytes().chunks(64) {
            pem.push_str(&String::from_utf8_lossy(line));
            pem.push('\n');
        }
        pem.push_str(&format!("-----END {}-----\n", label));
        pem
    }
}

impl Default for InMemoryCertificateAuthority {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CertificateAuthority for InMemoryCertificateAuthority {
    async fn issue_certificate(
        &self,
        team: &TeamId,
        subject: &str,
        public_key_pem: &str,
        kind: CertificateKind,
        expires_at: DateTime<Utc>,
    ) -> Result<String> {
        let mut serial = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut serial);

        let id = uuid::Uuid::new_v4().to_string();
        let certificate = Certificate {
            id: id.clone(),
            team: team.clone(),
            serial: hex::encode(serial),
            common_name: subject.to_string(),
            kind,
            status: CertificateStatus::Issuing,
            issued_at: None,
            expires_at,
            revoked_reason: None,
        };

        self.certificates.write().await.insert(
            id.clone(),
            CaRecord {
                certificate,
                public_key_pem: public_key_pem.to_string(),
                pending_polls: 0,
            },
        );
        Ok(id)
    }

    async fn download_certificate(&self, team: &TeamId, cert_id: &str) -> Result<CertificateDownload> {
        let mut certificates = self.certificates.write().await;
        let record = certificates
            .get_mut(cert_id)
            .filter(|r| &r.certificate.team == team)
            .ok_or_else(|| CustodyError::CertificateNotFound(cert_id.to_string()))?;

        if record.certificate.status == CertificateStatus::Issuing {
            if record.pending_polls < self.issue_after_polls {
                record.pending_polls += 1;
                return Ok(CertificateDownload::Pending);
            }
            record.certificate.status = CertificateStatus::Issued;
            record.certificate.issued_at = Some(Utc::now());
        }

        let body = serde_json::json!({
            "certificate": &record.certificate,
            "public_key": &record.public_key_pem,
        });
        Ok(CertificateDownload::Issued {
            pem: Self::pem_block("CERTIFICATE", body.to_string().as_bytes()),
            serial: record.certificate.serial.clone(),
        })
    }

    async fn revoke_certificate(&self, serial: &str, reason: &str) -> Result<()> {
        let mut certificates = self.certificates.write().await;
        let record = certificates
            .values_mut()
            .find(|r| r.certificate.serial == serial)
            .ok_or_else(|| CustodyError::CertificateNotFound(serial.to_string()))?;

        match record.certificate.status {
            CertificateStatus::Issuing | CertificateStatus::Issued => {
                record.certificate.status = CertificateStatus::Revoked;
                record.certificate.revoked_reason = Some(reason.to_string());
            }
            CertificateStatus::Revoked | CertificateStatus::Expired => {}
        }
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut purged = 0;
        for record in self.certificates.write().await.values_mut() {
            let cert = &mut record.certificate;
            if cert.expires_at <= now
                && matches!(cert.status, CertificateStatus::Issuing | CertificateStatus::Issued)
            {
                cert.status = CertificateStatus::Expired;
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn root_certificate(&self) -> Result<String> {
        Ok(Self::pem_block("CERTIFICATE", b"in-memory development root CA"))
    }
}

/// Material handed to a newly provisioned robot.
#[derive(Clone)]
pub struct RobotCredentials {
    pub private_key: String,
    pub certificate: String,
    pub serial: String,
    pub root_ca: String,
}

impl fmt::Debug for RobotCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RobotCredentials")
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

/// Knobs for [`issue_robot_credentials`].
#[derive(Debug, Clone, Copy)]
pub struct CredentialOptions {
    pub key_bits: usize,
    pub expires_at: DateTime<Utc>,
    pub poll_attempts: u32,
    pub poll_backoff: Duration,
}

/// Generate a robot key pair, store it, and obtain a certificate for it.
pub async fn issue_robot_credentials(
    keys: &dyn KeyStorage,
    ca: &dyn CertificateAuthority,
    team: &TeamId,
    robot: &RobotId,
    options: CredentialOptions,
) -> Result<RobotCredentials> {
    let bits = options.key_bits;
    let signer = tokio::task::spawn_blocking(move || Signer::generate_with_bits(bits))
        .await
        .map_err(|e| CustodyError::Unavailable(e.to_string()))?
        .map_err(|e| CustodyError::InvalidKey(e.to_string()))?;

    let pair = KeyPair::from_signer(&signer)?;
    let key_id = KeyId::Robot {
        team: team.clone(),
        robot: robot.clone(),
    };
    keys.put_key_pair(&key_id, pair.clone()).await?;

    let issued = async {
        let cert_id = ca
            .issue_certificate(
                team,
                &robot.0,
                &pair.public_key,
                CertificateKind::Robot,
                options.expires_at,
            )
            .await?;
        let (certificate, serial) =
            await_certificate(ca, team, &cert_id, options.poll_attempts, options.poll_backoff).await?;
        let root_ca = ca.root_certificate().await?;
        Ok::<_, CustodyError>((certificate, serial, root_ca))
    }
    .await;

    let (certificate, serial, root_ca) = match issued {
        Ok(issued) => issued,
        Err(e) => {
            if let Err(cleanup) = keys.delete_key_pair(&key_id).await {
                tracing::warn!(key = %key_id, error = %cleanup, "failed to discard robot key pair");
            }
            return Err(e);
        }
    };

    tracing::info!(team = %team, robot = %robot, "issued robot credentials");

    Ok(RobotCredentials {
        private_key: pair.private_key.unwrap_or_default(),
        certificate,
        serial,
        root_ca,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use uptane_core::Signer;
    use std::sync::OnceLock;

    /// Small RSA keys shared by every test in the crate.
    pub fn signer(index: usize) -> &'static Signer {
        static KEYS: OnceLock<Vec<Signer>> = OnceLock::new();
        &KEYS.get_or_init(|| {
            (0..12)
                .map(|_| Signer::generate_with_bits(1024).unwrap())
                .collect()
        })[index]
    }
}
