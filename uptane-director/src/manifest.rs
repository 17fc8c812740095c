//! Robot manifest verification.
//!
//! ## Verification Flow
//! 1. Robot exists
//! 2. Every reporting ECU's public key loads
//! 3. Manifest matches the schema
//! 4. Primary ECU report present
//! 5. Reporting ECUs are exactly the registered ECUs
//! 6. Top-level signature by the primary ECU
//! 7. Each report signed by its ECU
//! 8. No report counter reused from an accepted manifest
//! 9. No attacks reported
//!
//! The first three steps load the [`CheckContext`]; the rest are the ordered
//! [`CHECKS`] slice. The manifest is stored with its validity whatever the
//! outcome. Manifests of one robot are processed one at a time.

use crate::custody::{CustodyError, KeyId, KeyStorage};
use crate::error::DirectorError;
use crate::events::{AuditAction, AuditEvent, AuditResource, Event, EventPublisher};
use crate::inventory::{Ecu, InventoryStore, ManifestRecord, RolloutRobotEcu};
use crate::store::KeyedLocks;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uptane_core::manifest::reporting_serials;
use uptane_core::{EcuSerial, ParsedManifest, PublicKey, RobotId, TeamId};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Robot not found")]
    RobotNotFound,

    #[error("Could not load key of ECU {0}")]
    KeyNotLoaded(EcuSerial),

    #[error("Invalid manifest: {0}")]
    InvalidSchema(String),

    #[error("Primary ECU did not report")]
    MissingPrimaryReport,

    #[error("Registered ECU {0} did not report")]
    MissingEcuReport(EcuSerial),

    #[error("Unregistered ECU {0} reported")]
    UnknownEcuReport(EcuSerial),

    #[error("Manifest signature is invalid")]
    InvalidSignature,

    #[error("Report signature of ECU {0} is invalid")]
    InvalidReportSignature(EcuSerial),

    #[error("Report counter was already used")]
    InvalidReportCounter,

    #[error("ECU {0} reported an attack")]
    AttackIdentified(EcuSerial),
}

impl ManifestError {
    pub fn code(&self) -> &'static str {
        match self {
            ManifestError::RobotNotFound => "robot_not_found",
            ManifestError::KeyNotLoaded(_) => "key_not_loaded",
            ManifestError::InvalidSchema(_) => "invalid_schema",
            ManifestError::MissingPrimaryReport => "missing_primary_report",
            ManifestError::MissingEcuReport(_) => "missing_ecu_report",
            ManifestError::UnknownEcuReport(_) => "unknown_ecu_report",
            ManifestError::InvalidSignature => "invalid_signature",
            ManifestError::InvalidReportSignature(_) => "invalid_report_signature",
            ManifestError::InvalidReportCounter => "invalid_report_counter",
            ManifestError::AttackIdentified(_) => "attack_identified",
        }
    }
}

/// Everything the checks look at, loaded once.
pub struct CheckContext<'a> {
    pub manifest: &'a ParsedManifest,
    pub registered: &'a [Ecu],
    pub keys: &'a BTreeMap<EcuSerial, PublicKey>,
    /// Counters per ECU from the robot's accepted manifests
    pub seen_counters: &'a BTreeMap<EcuSerial, BTreeSet<u64>>,
}

pub type Check = fn(&CheckContext<'_>) -> Result<(), ManifestError>;

/// Checks run in order after loading; the first failure wins.
pub const CHECKS: &[(&str, Check)] = &[
    ("primary_report", check_primary_report),
    ("ecu_registration", check_ecu_registration),
    ("top_signature", check_top_signature),
    ("report_signatures", check_report_signatures),
    ("report_counters", check_report_counters),
    ("attacks", check_attacks),
];

fn check_primary_report(ctx: &CheckContext<'_>) -> Result<(), ManifestError> {
    let primary = ctx.manifest.primary_serial();
    if ctx.manifest.reports().any(|(serial, _)| serial == primary) {
        Ok(())
    } else {
        Err(ManifestError::MissingPrimaryReport)
    }
}

fn check_ecu_registration(ctx: &CheckContext<'_>) -> Result<(), ManifestError> {
    let reporting: BTreeSet<&EcuSerial> = ctx.manifest.reports().map(|(serial, _)| serial).collect();
    let registered: BTreeSet<&EcuSerial> = ctx.registered.iter().map(|e| &e.serial).collect();

    if let Some(missing) = registered.difference(&reporting).next() {
        return Err(ManifestError::MissingEcuReport((*missing).clone()));
    }
    if let Some(unknown) = reporting.difference(&registered).next() {
        return Err(ManifestError::UnknownEcuReport((*unknown).clone()));
    }
    Ok(())
}

fn check_top_signature(ctx: &CheckContext<'_>) -> Result<(), ManifestError> {
    let primary = ctx.manifest.primary_serial();
    let key = ctx
        .keys
        .get(primary)
        .ok_or_else(|| ManifestError::KeyNotLoaded(primary.clone()))?;
    let bytes = ctx.manifest.signed_bytes();

    if ctx
        .manifest
        .manifest
        .signatures
        .iter()
        .any(|s| key.verify(bytes, &s.sig))
    {
        Ok(())
    } else {
        Err(ManifestError::InvalidSignature)
    }
}

fn check_report_signatures(ctx: &CheckContext<'_>) -> Result<(), ManifestError> {
    for (serial, report) in ctx.manifest.reports() {
        let invalid = || ManifestError::InvalidReportSignature(serial.clone());
        let key = ctx.keys.get(serial).ok_or_else(invalid)?;
        let bytes = ctx.manifest.report_bytes(serial).ok_or_else(invalid)?;
        if !report.signatures.iter().any(|s| key.verify(bytes, &s.sig)) {
            return Err(invalid());
        }
    }
    Ok(())
}

fn check_report_counters(ctx: &CheckContext<'_>) -> Result<(), ManifestError> {
    for (serial, report) in ctx.manifest.reports() {
        let reused = ctx
            .seen_counters
            .get(serial)
            .is_some_and(|seen| seen.contains(&report.signed.report_counter));
        if reused {
            return Err(ManifestError::InvalidReportCounter);
        }
    }
    Ok(())
}

fn check_attacks(ctx: &CheckContext<'_>) -> Result<(), ManifestError> {
    match ctx
        .manifest
        .reports()
        .find(|(_, report)| !report.signed.attacks_detected.is_empty())
    {
        Some((serial, _)) => Err(ManifestError::AttackIdentified(serial.clone())),
        None => Ok(()),
    }
}

/// Result of an accepted manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestOutcome {
    /// The robot reported images other than its active rollout assigns
    pub metadata_required: bool,
}

/// Verifies and records robot manifests.
pub struct ManifestPipeline {
    inventory: Arc<dyn InventoryStore>,
    keys: Arc<dyn KeyStorage>,
    events: EventPublisher,
    locks: KeyedLocks<(TeamId, RobotId)>,
}

impl ManifestPipeline {
    pub fn new(inventory: Arc<dyn InventoryStore>, keys: Arc<dyn KeyStorage>, events: EventPublisher) -> Self {
        Self {
            inventory,
            keys,
            events,
            locks: KeyedLocks::new(),
        }
    }

    /// Verify a manifest, record it, and flag the robot if it needs new
    /// director metadata.
    pub async fn process(
        &self,
        team: &TeamId,
        robot: &RobotId,
        raw: Value,
    ) -> Result<ManifestOutcome, DirectorError> {
        let _guard = self.locks.lock((team.clone(), robot.clone())).await;

        let verdict = self.verify(team, robot, &raw).await;

        let (valid, counters) = match &verdict {
            Ok(parsed) => (true, report_counters(parsed)),
            Err(Verdict::Rejected(_)) => (false, BTreeMap::new()),
            Err(Verdict::Failed(e)) => {
                warn!(team = %team, robot = %robot, error = %e, "manifest verification aborted");
                (false, BTreeMap::new())
            }
        };
        self.inventory
            .insert_manifest(ManifestRecord {
                team: team.clone(),
                robot: robot.clone(),
                raw,
                valid,
                report_counters: counters,
                received_at: Utc::now(),
            })
            .await?;

        let parsed = match verdict {
            Ok(parsed) => parsed,
            Err(Verdict::Rejected(e)) => {
                info!(team = %team, robot = %robot, code = e.code(), "rejected manifest");
                self.audit(team, robot, AuditAction::Rejected, json!({ "code": e.code() }));
                return Err(e.into());
            }
            Err(Verdict::Failed(e)) => return Err(e),
        };

        self.audit(team, robot, AuditAction::Accepted, json!({}));

        let metadata_required = self.images_differ(team, robot, &parsed).await?;
        if metadata_required {
            info!(team = %team, robot = %robot, "robot requires new director metadata");
            self.events.publish(Event::MetadataRequired {
                team: team.clone(),
                robot: robot.clone(),
            });
        } else {
            debug!(team = %team, robot = %robot, "robot matches its active rollout");
        }

        Ok(ManifestOutcome { metadata_required })
    }

    async fn verify(&self, team: &TeamId, robot: &RobotId, raw: &Value) -> Result<ParsedManifest, Verdict> {
        if self.inventory.get_robot(team, robot).await?.is_none() {
            return Err(ManifestError::RobotNotFound.into());
        }

        let mut keys = BTreeMap::new();
        for serial in reporting_serials(raw) {
            let id = KeyId::Ecu {
                team: team.clone(),
                robot: robot.clone(),
                ecu: serial.clone(),
            };
            let key = match self.keys.get_key_pair(&id).await {
                Ok(pair) => pair.public().map_err(|_| ManifestError::KeyNotLoaded(serial.clone()))?,
                Err(CustodyError::KeyNotFound(_)) | Err(CustodyError::InvalidKey(_)) => {
                    return Err(ManifestError::KeyNotLoaded(serial).into())
                }
                Err(e) => return Err(Verdict::Failed(e.into())),
            };
            keys.insert(serial, key);
        }

        let manifest =
            ParsedManifest::parse(raw).map_err(|e| ManifestError::InvalidSchema(e.to_string()))?;

        let registered = self.inventory.ecus_for_robot(team, robot).await?;
        let seen_counters = self.seen_counters(team, robot).await?;

        let ctx = CheckContext {
            manifest: &manifest,
            registered: &registered,
            keys: &keys,
            seen_counters: &seen_counters,
        };
        for (name, check) in CHECKS {
            if let Err(e) = check(&ctx) {
                debug!(check = *name, code = e.code(), "manifest check failed");
                return Err(e.into());
            }
        }
        Ok(manifest)
    }

    async fn seen_counters(
        &self,
        team: &TeamId,
        robot: &RobotId,
    ) -> Result<BTreeMap<EcuSerial, BTreeSet<u64>>, DirectorError> {
        let mut seen: BTreeMap<EcuSerial, BTreeSet<u64>> = BTreeMap::new();
        for record in self.inventory.manifests_for_robot(team, robot).await? {
            if !record.valid {
                continue;
            }
            for (serial, counter) in record.report_counters {
                seen.entry(serial).or_default().insert(counter);
            }
        }
        Ok(seen)
    }

    /// Whether any ECU runs something other than what the robot's active
    /// rollout assigns it.
    async fn images_differ(
        &self,
        team: &TeamId,
        robot: &RobotId,
        manifest: &ParsedManifest,
    ) -> Result<bool, DirectorError> {
        let active = self
            .inventory
            .rollout_robots_for_robot(team, robot)
            .await?
            .into_iter()
            .filter(|a| a.status.is_active())
            .max_by(|a, b| a.created_at.cmp(&b.created_at));
        let Some(active) = active else {
            return Ok(false);
        };

        let assigned: Vec<RolloutRobotEcu> = self.inventory.rollout_robot_ecus(&active.id).await?;
        for record in assigned {
            let Some((_, report)) = manifest.reports().find(|(serial, _)| **serial == record.ecu) else {
                continue;
            };
            let Some(image) = self.inventory.get_image(team, &record.image).await? else {
                warn!(team = %team, image = %record.image, "rollout image no longer exists");
                continue;
            };
            if report.signed.installed_image.fileinfo.hashes.sha256 != image.sha256 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn audit(&self, team: &TeamId, robot: &RobotId, action: AuditAction, meta: Value) {
        self.events.publish(Event::Audit(
            AuditEvent::robot(team, robot, AuditResource::Manifest, action).with_meta(meta),
        ));
    }
}

/// Why verification stopped: a rejected manifest, or a backend failure.
enum Verdict {
    Rejected(ManifestError),
    Failed(DirectorError),
}

impl From<ManifestError> for Verdict {
    fn from(e: ManifestError) -> Self {
        Verdict::Rejected(e)
    }
}

impl From<crate::store::StoreError> for Verdict {
    fn from(e: crate::store::StoreError) -> Self {
        Verdict::Failed(e.into())
    }
}

impl From<DirectorError> for Verdict {
    fn from(e: DirectorError) -> Self {
        Verdict::Failed(e)
    }
}

fn report_counters(manifest: &ParsedManifest) -> BTreeMap<EcuSerial, u64> {
    manifest
        .reports()
        .map(|(serial, report)| (serial.clone(), report.signed.report_counter))
        .collect()
}


#[cfg(test)]
mod tests {
    use super::test_support::{signed_manifest, signed_report};
    use super::*;
    use crate::custody::test_support::signer;
    use crate::custody::{InMemoryKeyStorage, KeyPair};
    use crate::events::{channel, EventSubscriber};
    use crate::inventory::{
        Image, ImageId, InMemoryInventory, Robot, RolloutRobot, RolloutRobotStatus,
    };
    use uptane_core::metadata::TargetFormat;
    use uptane_core::HardwareId;

    const OLD: &str = "1111111111111111111111111111111111111111111111111111111111111111";
    const NEW: &str = "2222222222222222222222222222222222222222222222222222222222222222";

    struct Fixture {
        pipeline: ManifestPipeline,
        inventory: Arc<InMemoryInventory>,
        subscriber: EventSubscriber,
    }

    fn team() -> TeamId {
        TeamId("team-1".into())
    }

    fn robot() -> RobotId {
        RobotId("D".into())
    }

    /// Robot D with primary P (key 0) and secondary S (key 1).
    async fn fixture() -> Fixture {
        let inventory = Arc::new(InMemoryInventory::new());
        let keys = Arc::new(InMemoryKeyStorage::new());
        inventory.create_robot(Robot::new(team(), robot())).await.unwrap();

        let mut ecus = Vec::new();
        for (index, serial) in ["P", "S"].into_iter().enumerate() {
            let id = KeyId::Ecu {
                team: team(),
                robot: robot(),
                ecu: EcuSerial(serial.into()),
            };
            keys.put_key_pair(&id, KeyPair::public_only(signer(index).public_key().to_pem()))
                .await
                .unwrap();
            ecus.push(Ecu {
                team: team(),
                robot: robot(),
                serial: EcuSerial(serial.into()),
                hardware_id: HardwareId(format!("hw-{}", serial)),
                primary: serial == "P",
                installed_image: None,
                status: None,
            });
        }
        inventory.insert_ecus(ecus).await.unwrap();

        let (publisher, subscriber) = channel(3);
        Fixture {
            pipeline: ManifestPipeline::new(inventory.clone(), keys, publisher),
            inventory,
            subscriber,
        }
    }

    fn manifest(counter: u64) -> Value {
        signed_manifest(
            signer(0),
            "P",
            vec![
                ("P", signed_report(signer(0), "P", OLD, counter, "")),
                ("S", signed_report(signer(1), "S", OLD, counter, "")),
            ],
        )
    }

    async fn rejected_code(f: &Fixture, raw: Value) -> &'static str {
        match f.pipeline.process(&team(), &robot(), raw).await {
            Err(DirectorError::Manifest(e)) => e.code(),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_valid_manifest_accepted_and_recorded() {
        let f = fixture().await;
        let outcome = f.pipeline.process(&team(), &robot(), manifest(1)).await.unwrap();
        assert!(!outcome.metadata_required);

        let records = f.inventory.manifests_for_robot(&team(), &robot()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].valid);
        assert_eq!(records[0].report_counters.get(&EcuSerial("S".into())), Some(&1));
    }

    #[tokio::test]
    async fn test_unknown_robot() {
        let f = fixture().await;
        let result = f
            .pipeline
            .process(&team(), &RobotId("ghost".into()), manifest(1))
            .await;
        assert!(matches!(result, Err(DirectorError::Manifest(ManifestError::RobotNotFound))));
    }

    #[tokio::test]
    async fn test_replayed_counter_rejected() {
        let f = fixture().await;
        f.pipeline.process(&team(), &robot(), manifest(7)).await.unwrap();
        assert_eq!(rejected_code(&f, manifest(7)).await, "invalid_report_counter");

        // a fresh counter is fine, and the rejected one was stored invalid
        f.pipeline.process(&team(), &robot(), manifest(8)).await.unwrap();
        let records = f.inventory.manifests_for_robot(&team(), &robot()).await.unwrap();
        let validity: Vec<bool> = records.iter().map(|r| r.valid).collect();
        assert_eq!(validity, vec![true, false, true]);
    }

    #[tokio::test]
    async fn test_rejected_counters_do_not_count_as_seen() {
        let f = fixture().await;
        let mut tampered = manifest(3);
        tampered["signed"]["ecu_version_manifests"]["S"]["signed"]["attacks_detected"] =
            json!("rollback");
        // the report is covered by the top-level signature too
    assert_eq!(rejected_code(&f, tampered).await, "invalid_signature");

        f.pipeline.process(&team(), &robot(), manifest(3)).await.unwrap();
    }

    #[tokio::test]
    async fn test_check_order() {
        let f = fixture().await;

        // unregistered ECU has no key
        let raw = signed_manifest(
            signer(0),
            "P",
            vec![
                ("P", signed_report(signer(0), "P", OLD, 1, "")),
                ("S", signed_report(signer(1), "S", OLD, 1, "")),
                ("X", signed_report(signer(2), "X", OLD, 1, "")),
            ],
        );
        assert_eq!(rejected_code(&f, raw).await, "key_not_loaded");

        let raw = json!({"signatures": [], "signed": {"primary_ecu_serial": "P"}});
        assert_eq!(rejected_code(&f, raw).await, "invalid_schema");

        let raw = signed_manifest(signer(0), "P", vec![("S", signed_report(signer(1), "S", OLD, 1, ""))]);
        assert_eq!(rejected_code(&f, raw).await, "missing_primary_report");

        let raw = signed_manifest(signer(0), "P", vec![("P", signed_report(signer(0), "P", OLD, 1, ""))]);
        assert_eq!(rejected_code(&f, raw).await, "missing_ecu_report");

        // signed by the secondary instead of the primary
        let mut raw = manifest(1);
        raw["signatures"] = signed_manifest(signer(1), "P", vec![])["signatures"].clone();
        assert_eq!(rejected_code(&f, raw).await, "invalid_signature");

        let raw = signed_manifest(
            signer(0),
            "P",
            vec![
                ("P", signed_report(signer(0), "P", OLD, 1, "")),
                ("S", signed_report(signer(1), "S", OLD, 1, "rollback attack")),
            ],
        );
        assert_eq!(rejected_code(&f, raw).await, "attack_identified");

        let records = f.inventory.manifests_for_robot(&team(), &robot()).await.unwrap();
        assert_eq!(records.len(), 6);
        assert!(records.iter().all(|r| !r.valid));
    }

    #[tokio::test]
    async fn test_mismatch_requests_metadata() {
        let mut f = fixture().await;
        f.inventory
            .insert_image(Image {
                team: team(),
                id: ImageId("img-2".into()),
                size: 10,
                sha256: NEW.into(),
                sha512: None,
                format: TargetFormat::Binary,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        f.inventory
            .insert_rollout_robots(vec![RolloutRobot {
                id: "rr-1".into(),
                rollout_id: "ro-1".into(),
                team: team(),
                robot: robot(),
                status: RolloutRobotStatus::Scheduled,
                created_at: Utc::now(),
            }])
            .await
            .unwrap();
        f.inventory
            .put_rollout_robot_ecus(
                "rr-1",
                vec![RolloutRobotEcu {
                    rollout_robot_id: "rr-1".into(),
                    ecu: EcuSerial("S".into()),
                    hardware_id: HardwareId("hw-S".into()),
                    image: ImageId("img-2".into()),
                    status: None,
                }],
            )
            .await
            .unwrap();

        let outcome = f.pipeline.process(&team(), &robot(), manifest(1)).await.unwrap();
        assert!(outcome.metadata_required);

        let mut kinds = Vec::new();
        while let Some(delivery) = f.subscriber.try_next() {
            kinds.push(delivery.event().kind());
            delivery.ack();
        }
        assert_eq!(kinds, vec!["audit", "metadata_required"]);

        // reporting the assigned image clears the mismatch
        let raw = signed_manifest(
            signer(0),
            "P",
            vec![
                ("P", signed_report(signer(0), "P", OLD, 2, "")),
                ("S", signed_report(signer(1), "S", NEW, 2, "")),
            ],
        );
        let outcome = f.pipeline.process(&team(), &robot(), raw).await.unwrap();
        assert!(!outcome.metadata_required);
    }

    #[test]
    fn test_checks_are_ordered() {
        let names: Vec<&str> = CHECKS.iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            vec![
                "primary_report",
                "ecu_registration",
                "top_signature",
                "report_signatures",
                "report_counters",
                "attacks"
            ]
        );
    }
}
