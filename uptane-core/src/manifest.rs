//! Wire types sent by robots: version manifests and ECU registration.
//!
//! Manifests are parsed into typed structs for checking, but signatures must be
//! verified over the canonical form of the JSON the robot actually sent, which
//! may carry fields not modelled here (aktualizr adds `installation_report`,
//! for instance). [`ParsedManifest`] keeps both views.

use crate::canonical::{canonicalize, CanonicalError};
use crate::metadata::{Hashes, Signature, TufKey};
use crate::types::{EcuSerial, HardwareId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub hashes: Hashes,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledImage {
    pub filepath: String,
    pub fileinfo: FileInfo,
}

/// The signed body of one ECU's version report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcuVersionReport {
    pub ecu_serial: EcuSerial,
    /// Free-form; empty when the ECU detected nothing.
    pub attacks_detected: String,
    pub previous_timeserver_time: String,
    pub report_counter: u64,
    pub timeserver_time: String,
    pub installed_image: InstalledImage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEcuReport {
    pub signatures: Vec<Signature>,
    pub signed: EcuVersionReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestBody {
    pub primary_ecu_serial: EcuSerial,
    pub ecu_version_manifests: BTreeMap<EcuSerial, SignedEcuReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_report: Option<Value>,
}

/// A robot's version manifest, signed by its primary ECU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotManifest {
    pub signatures: Vec<Signature>,
    pub signed: ManifestBody,
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Manifest does not match schema: {0}")]
    Shape(#[from] serde_json::Error),

    #[error("{0} requires at least one signature")]
    NoSignatures(String),

    #[error("Report keyed as {key} is for ECU {serial}")]
    SerialMismatch { key: EcuSerial, serial: EcuSerial },

    #[error("Manifest is not canonicalizable: {0}")]
    Canonical(#[from] CanonicalError),
}

/// A manifest together with the canonical bytes its signatures cover.
#[derive(Debug, Clone)]
pub struct ParsedManifest {
    pub manifest: RobotManifest,
    signed_bytes: Vec<u8>,
    report_bytes: BTreeMap<EcuSerial, Vec<u8>>,
}

impl ParsedManifest {
    /// Validate the shape of a raw manifest.
    pub fn parse(raw: &Value) -> Result<Self, SchemaError> {
        let manifest: RobotManifest = serde_json::from_value(raw.clone())?;

        if manifest.signatures.is_empty() {
            return Err(SchemaError::NoSignatures("manifest".to_string()));
        }
        for (key, report) in &manifest.signed.ecu_version_manifests {
            if report.signatures.is_empty() {
                return Err(SchemaError::NoSignatures(format!("report {}", key)));
            }
            if &report.signed.ecu_serial != key {
                return Err(SchemaError::SerialMismatch {
                    key: key.clone(),
                    serial: report.signed.ecu_serial.clone(),
                });
            }
        }

        let signed = &raw["signed"];
        let signed_bytes = canonicalize(signed)?;
        let mut report_bytes = BTreeMap::new();
        for key in manifest.signed.ecu_version_manifests.keys() {
            let report = &signed["ecu_version_manifests"][key.0.as_str()]["signed"];
            report_bytes.insert(key.clone(), canonicalize(report)?);
        }

        Ok(Self {
            manifest,
            signed_bytes,
            report_bytes,
        })
    }

    /// Canonical bytes of the top-level `signed` object.
    pub fn signed_bytes(&self) -> &[u8] {
        &self.signed_bytes
    }

    /// Canonical bytes of one report's `signed` object.
    pub fn report_bytes(&self, serial: &EcuSerial) -> Option<&[u8]> {
        self.report_bytes.get(serial).map(Vec::as_slice)
    }

    pub fn primary_serial(&self) -> &EcuSerial {
        &self.manifest.signed.primary_ecu_serial
    }

    pub fn reports(&self) -> impl Iterator<Item = (&EcuSerial, &SignedEcuReport)> {
        self.manifest.signed.ecu_version_manifests.iter()
    }
}

/// Serials of the ECUs reporting in a raw manifest, read before schema validation
/// so their keys can be loaded.
pub fn reporting_serials(raw: &Value) -> Vec<EcuSerial> {
    raw.pointer("/signed/ecu_version_manifests")
        .and_then(Value::as_object)
        .map(|reports| reports.keys().map(|k| EcuSerial(k.clone())).collect())
        .unwrap_or_default()
}

/// One ECU in a registration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcuRegistration {
    pub ecu_serial: EcuSerial,
    pub hardware_identifier: HardwareId,
    #[serde(rename = "clientKey")]
    pub client_key: TufKey,
}

/// Body of `POST /ecus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcuRegistrationRequest {
    pub primary_ecu_serial: EcuSerial,
    pub ecus: Vec<EcuRegistration>,
}
