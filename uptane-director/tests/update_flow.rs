//! End-to-end update of one robot through a rollout.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use uptane_core::manifest::EcuRegistration;
use uptane_core::metadata::{verify_snapshot_reference, verify_timestamp_reference, TargetFormat, TufKey};
use uptane_core::{EcuRegistrationRequest, EcuSerial, HardwareId, RobotId, Role, Signed, Signer, TeamId};
use uptane_director::events::MemoryAuditSink;
use uptane_director::inventory::{Image, ImageId, RobotStatus, RolloutRobotStatus, RolloutStatus};
use uptane_director::{
    channel, Backends, Config, Director, EventDispatcher, EventSubscriber, InMemoryCertificateAuthority,
    InMemoryInventory, InMemoryKeyStorage, InMemoryMetadataStore, RolloutTargets,
};

const H1: &str = "1111111111111111111111111111111111111111111111111111111111111111";
const H2: &str = "2222222222222222222222222222222222222222222222222222222222222222";

struct Fleet {
    director: Director,
    events: EventSubscriber,
    dispatcher: EventDispatcher,
    audit: Arc<MemoryAuditSink>,
    team: TeamId,
    robot: RobotId,
    primary: Signer,
    secondary: Signer,
}

impl Fleet {
    /// Team with images I1 and I2 and robot D: primary P on `hw-p`,
    /// secondary S on `hw-s`.
    async fn new() -> Self {
        let (publisher, events) = channel(3);
        let config = Config {
            key_bits: 1024,
            ..Config::default()
        };
        let director = Director::new(
            Backends {
                metadata: Arc::new(InMemoryMetadataStore::new()),
                inventory: Arc::new(InMemoryInventory::new()),
                keys: Arc::new(InMemoryKeyStorage::new()),
                ca: Arc::new(InMemoryCertificateAuthority::new()),
            },
            config,
            publisher,
        );
        let audit = Arc::new(MemoryAuditSink::new());
        let dispatcher = EventDispatcher::new(director.rollouts().clone(), audit.clone());

        let team = TeamId("team-1".into());
        let robot = RobotId("D".into());
        director.bootstrap_team(&team).await.unwrap();
        for (id, sha256) in [("I1", H1), ("I2", H2)] {
            director
                .publish_image(Image {
                    team: team.clone(),
                    id: ImageId(id.into()),
                    size: 1024,
                    sha256: sha256.into(),
                    sha512: None,
                    format: TargetFormat::Binary,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        director.provision_robot(&team, &robot).await.unwrap();
        let primary = Signer::generate_with_bits(1024).unwrap();
        let secondary = Signer::generate_with_bits(1024).unwrap();
        let registration = |serial: &str, hw: &str, signer: &Signer| EcuRegistration {
            ecu_serial: EcuSerial(serial.into()),
            hardware_identifier: HardwareId(hw.into()),
            client_key: TufKey::from_public_key(signer.public_key()),
        };
        director
            .register_ecus(
                &team,
                &robot,
                EcuRegistrationRequest {
                    primary_ecu_serial: EcuSerial("P".into()),
                    ecus: vec![
                        registration("P", "hw-p", &primary),
                        registration("S", "hw-s", &secondary),
                    ],
                },
            )
            .await
            .unwrap();

        Self {
            director,
            events,
            dispatcher,
            audit,
            team,
            robot,
            primary,
            secondary,
        }
    }

    /// Launched rollout moving `hw-s` ECUs to I2.
    async fn rollout(&self) -> String {
        let mut images = BTreeMap::new();
        images.insert(HardwareId("hw-s".into()), ImageId("I2".into()));
        let engine = self.director.rollouts();
        let rollout = engine
            .create_rollout(&self.team, "secondary update", images, RolloutTargets::HardwareIds)
            .await
            .unwrap();
        engine.launch_rollout(&self.team, &rollout.id).await.unwrap();
        rollout.id
    }

    async fn association(&self, rollout_id: &str) -> (String, RolloutRobotStatus) {
        let associations = self
            .director
            .inventory()
            .rollout_robots(rollout_id)
            .await
            .unwrap();
        assert_eq!(associations.len(), 1);
        (associations[0].id.clone(), associations[0].status)
    }

    fn manifest(&self, secondary_sha256: &str, counter: u64) -> Value {
        let report = |signer: &Signer, serial: &str, sha256: &str| {
            let signed = json!({
                "ecu_serial": serial,
                "attacks_detected": "",
                "previous_timeserver_time": "2023-01-01T00:00:00Z",
                "report_counter": counter,
                "timeserver_time": "2023-01-01T00:00:00Z",
                "installed_image": {
                    "filepath": format!("{}.img", serial),
                    "fileinfo": { "hashes": { "sha256": sha256 }, "length": 1024 }
                }
            });
            serde_json::to_value(Signed::sign(signed, signer).unwrap()).unwrap()
        };
        let signed = json!({
            "primary_ecu_serial": "P",
            "ecu_version_manifests": {
                "P": report(&self.primary, "P", H1),
                "S": report(&self.secondary, "S", secondary_sha256),
            }
        });
        serde_json::to_value(Signed::sign(signed, &self.primary).unwrap()).unwrap()
    }

    fn telemetry(&self, kind: &str, correlation_id: &str, success: Option<bool>) -> uptane_director::TelemetryEvent {
        serde_json::from_value(json!({
            "id": format!("{}-{}", kind, correlation_id),
            "deviceTime": "2023-01-01T00:00:00Z",
            "eventType": { "id": kind, "version": 0 },
            "event": { "correlationId": correlation_id, "ecu": "S", "success": success }
        }))
        .unwrap()
    }

    /// Deliver everything queued on the bus.
    async fn drain(&mut self) {
        while let Some(delivery) = self.events.try_next() {
            self.dispatcher.dispatch(delivery).await;
        }
    }
}

#[tokio::test]
async fn test_rollout_updates_secondary() {
    let mut fleet = Fleet::new().await;
    let rollout_id = fleet.rollout().await;

    let summary = fleet.director.rollouts().process_pending().await.unwrap();
    assert_eq!(summary.scheduled, 1);
    let (association, status) = fleet.association(&rollout_id).await;
    assert_eq!(status, RolloutRobotStatus::Scheduled);

    // director targets assign I2 to S and nothing to P
    let targets = fleet
        .director
        .fetch_metadata(&fleet.team, &fleet.robot, Role::Targets, None)
        .await
        .unwrap();
    let targets = targets.as_targets().unwrap();
    assert_eq!(targets.signed.targets.len(), 1);
    let entry = &targets.signed.targets["I2"];
    assert!(entry.is_for_ecu(&EcuSerial("S".into())));
    assert!(!entry.is_for_ecu(&EcuSerial("P".into())));
    assert_eq!(entry.hashes.sha256, H2);
    assert_eq!(
        entry.custom.as_ref().unwrap().uri.as_deref(),
        Some("https://gateway.localhost/api/v0/robot/repo/images/I2")
    );
    assert_eq!(targets.signed.custom.as_ref().unwrap().correlation_id, association);

    let snapshot = fleet
        .director
        .fetch_metadata(&fleet.team, &fleet.robot, Role::Snapshot, None)
        .await
        .unwrap();
    let timestamp = fleet
        .director
        .fetch_metadata(&fleet.team, &fleet.robot, Role::Timestamp, None)
        .await
        .unwrap();
    verify_snapshot_reference(snapshot.as_snapshot().unwrap(), targets).unwrap();
    verify_timestamp_reference(timestamp.as_timestamp().unwrap(), snapshot.as_snapshot().unwrap()).unwrap();

    // the robot installs I2 on S and reports it
    for (kind, success) in [
        ("EcuDownloadStarted", None),
        ("EcuDownloadCompleted", Some(true)),
        ("EcuInstallationStarted", None),
        ("EcuInstallationCompleted", Some(true)),
    ] {
        let event = fleet.telemetry(kind, &association, success);
        fleet
            .director
            .handle_telemetry(&fleet.team, &fleet.robot, event)
            .await
            .unwrap();
    }
    let outcome = fleet
        .director
        .handle_manifest(&fleet.team, &fleet.robot, fleet.manifest(H2, 1))
        .await
        .unwrap();
    assert!(!outcome.metadata_required);
    fleet.drain().await;

    // scheduled moves through accepted to completed in one pass
    let summary = fleet.director.rollouts().process_statuses().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.rollouts_completed, 1);
    assert_eq!(fleet.association(&rollout_id).await.1, RolloutRobotStatus::Completed);

    let rollout = fleet
        .director
        .inventory()
        .get_rollout(&fleet.team, &rollout_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rollout.status, RolloutStatus::Completed);

    let ecus = fleet
        .director
        .inventory()
        .ecus_for_robot(&fleet.team, &fleet.robot)
        .await
        .unwrap();
    let secondary = ecus.iter().find(|e| e.serial.0 == "S").unwrap();
    assert_eq!(secondary.installed_image, Some(ImageId("I2".into())));
    assert_eq!(
        fleet.director.robot_status(&fleet.team, &fleet.robot).await.unwrap(),
        RobotStatus::UpToDate
    );

    // a second pass changes nothing
    assert!(fleet.director.rollouts().process_pending().await.unwrap().is_empty());
    assert!(fleet.director.rollouts().process_statuses().await.unwrap().is_empty());

    // replaying the manifest is refused
    let err = fleet
        .director
        .handle_manifest(&fleet.team, &fleet.robot, fleet.manifest(H2, 1))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_report_counter");

    assert!(!fleet.audit.events().is_empty());
}

#[tokio::test]
async fn test_mismatch_regenerates_director_metadata() {
    let mut fleet = Fleet::new().await;
    let rollout_id = fleet.rollout().await;
    fleet.director.rollouts().process_pending().await.unwrap();
    let (association, _) = fleet.association(&rollout_id).await;

    // targets replaced outside the rollout lose the correlation id
    fleet
        .director
        .chains()
        .write_director_targets(&fleet.team, &fleet.robot, BTreeMap::new(), None)
        .await
        .unwrap();

    let outcome = fleet
        .director
        .handle_manifest(&fleet.team, &fleet.robot, fleet.manifest(H1, 1))
        .await
        .unwrap();
    assert!(outcome.metadata_required);
    fleet.drain().await;

    let latest = fleet
        .director
        .fetch_metadata(&fleet.team, &fleet.robot, Role::Targets, None)
        .await
        .unwrap();
    assert_eq!(latest.version(), 3);
    let targets = latest.as_targets().unwrap();
    assert!(targets.signed.targets.contains_key("I2"));
    assert_eq!(targets.signed.custom.as_ref().unwrap().correlation_id, association);

    // still behind, but the metadata is already current
    let outcome = fleet
        .director
        .handle_manifest(&fleet.team, &fleet.robot, fleet.manifest(H1, 2))
        .await
        .unwrap();
    assert!(outcome.metadata_required);
    fleet.drain().await;
    let latest = fleet
        .director
        .fetch_metadata(&fleet.team, &fleet.robot, Role::Targets, None)
        .await
        .unwrap();
    assert_eq!(latest.version(), 3);
}

#[tokio::test]
async fn test_concurrent_writes_keep_versions_gap_free() {
    let fleet = Fleet::new().await;
    let chains = fleet.director.chains().clone();

    let mut handles = Vec::new();
    for i in 0..16 {
        let chains = chains.clone();
        let team = fleet.team.clone();
        let robot = fleet.robot.clone();
        handles.push(tokio::spawn(async move {
            chains
                .write_director_targets(&team, &robot, BTreeMap::new(), Some(format!("rr-{}", i)))
                .await
                .map(|t| t.signed.version)
        }));
    }

    let mut versions = Vec::new();
    for handle in handles {
        versions.push(handle.await.unwrap().unwrap());
    }
    versions.sort();
    assert_eq!(versions, (1..=16).collect::<Vec<u64>>());

    for role in [Role::Targets, Role::Snapshot, Role::Timestamp] {
        for version in 1..=16 {
            let doc = fleet
                .director
                .fetch_metadata(&fleet.team, &fleet.robot, role, Some(version))
                .await
                .unwrap();
            assert_eq!(doc.version(), version);
        }
    }

    let snapshot = fleet
        .director
        .fetch_metadata(&fleet.team, &fleet.robot, Role::Snapshot, None)
        .await
        .unwrap();
    let targets = fleet
        .director
        .fetch_metadata(&fleet.team, &fleet.robot, Role::Targets, None)
        .await
        .unwrap();
    verify_snapshot_reference(snapshot.as_snapshot().unwrap(), targets.as_targets().unwrap()).unwrap();
}
