//! Request-facing operations of the director service.
//!
//! Routing and authentication happen outside this crate; each method here is
//! what one already-authenticated request does.

use crate::chain::ChainWriter;
use crate::config::Config;
use crate::custody::{
    issue_robot_credentials, CertificateAuthority, CredentialOptions, CustodyError, KeyId, KeyPair,
    KeyStorage, RobotCredentials,
};
use crate::error::{DirectorError, Result};
use crate::events::{AuditAction, AuditEvent, AuditResource, Event, EventPublisher, TelemetryEvent};
use crate::inventory::{fold_robot_status, Ecu, Image, ImageId, InventoryStore, Robot, RobotStatus};
use crate::manifest::{ManifestOutcome, ManifestPipeline};
use crate::rollout::RolloutEngine;
use crate::store::{MetadataKey, MetadataStore};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};
use uptane_core::metadata::TargetBuilder;
use uptane_core::{EcuRegistrationRequest, Metadata, Repo, RobotId, Role, TargetsMetadata, TeamId};

/// Robot client certificates are valid this long.
const ROBOT_CERTIFICATE_DAYS: i64 = 365;

/// Backends the director runs on.
pub struct Backends {
    pub metadata: Arc<dyn MetadataStore>,
    pub inventory: Arc<dyn InventoryStore>,
    pub keys: Arc<dyn KeyStorage>,
    pub ca: Arc<dyn CertificateAuthority>,
}

pub struct Director {
    inventory: Arc<dyn InventoryStore>,
    keys: Arc<dyn KeyStorage>,
    ca: Arc<dyn CertificateAuthority>,
    chains: Arc<ChainWriter>,
    manifests: ManifestPipeline,
    rollouts: Arc<RolloutEngine>,
    events: EventPublisher,
}

impl Director {
    pub fn new(backends: Backends, config: Config, events: EventPublisher) -> Self {
        let chains = Arc::new(ChainWriter::new(backends.metadata, backends.keys.clone(), config));
        let manifests = ManifestPipeline::new(backends.inventory.clone(), backends.keys.clone(), events.clone());
        let rollouts = Arc::new(RolloutEngine::new(
            backends.inventory.clone(),
            chains.clone(),
            events.clone(),
        ));

        Self {
            inventory: backends.inventory,
            keys: backends.keys,
            ca: backends.ca,
            chains,
            manifests,
            rollouts,
            events,
        }
    }

    pub fn chains(&self) -> &Arc<ChainWriter> {
        &self.chains
    }

    pub fn rollouts(&self) -> &Arc<RolloutEngine> {
        &self.rollouts
    }

    pub fn inventory(&self) -> &Arc<dyn InventoryStore> {
        &self.inventory
    }

    pub fn certificate_authority(&self) -> &Arc<dyn CertificateAuthority> {
        &self.ca
    }

    /// Create the keys and initial metadata of a new team.
    pub async fn bootstrap_team(&self, team: &TeamId) -> Result<()> {
        self.chains.bootstrap_team(team).await?;
        self.audit(team, AuditResource::Team, AuditAction::Created, json!({}));
        self.audit(team, AuditResource::Metadata, AuditAction::Signed, json!({ "version": 1 }));
        Ok(())
    }

    /// Add an image to the inventory and list it in the image repository.
    pub async fn publish_image(&self, image: Image) -> Result<TargetsMetadata> {
        let team = image.team.clone();
        let id = image.id.clone();
        let entry = TargetBuilder::new()
            .length(image.size)
            .sha256(image.sha256.clone())
            .sha512(image.sha512.clone())
            .format(image.format)
            .build()?;

        // the inventory insert claims the id before anything is signed
        self.inventory.insert_image(image).await?;
        let targets = match self.chains.publish_image_target(&team, &id.0, entry).await {
            Ok(targets) => targets,
            Err(e) => {
                if let Err(cleanup) = self.inventory.delete_image(&team, &id).await {
                    warn!(team = %team, image = %id, error = %cleanup, "failed to roll back image record");
                }
                return Err(e);
            }
        };

        info!(team = %team, image = %id, version = targets.signed.version, "published image");
        self.audit(&team, AuditResource::Image, AuditAction::Created, json!({ "image": id }));
        Ok(targets)
    }

    pub async fn delete_image(&self, team: &TeamId, image: &ImageId) -> Result<()> {
        self.rollouts.delete_image(team, image).await
    }

    /// Create a robot and issue its client credentials.
    ///
    /// The robot record claims the id first. If the credentials cannot be
    /// issued the record and the robot key pair are removed again, so the
    /// request can be retried.
    pub async fn provision_robot(&self, team: &TeamId, robot: &RobotId) -> Result<RobotCredentials> {
        self.inventory
            .create_robot(Robot::new(team.clone(), robot.clone()))
            .await?;

        let config = self.chains.config();
        let options = CredentialOptions {
            key_bits: config.key_bits,
            expires_at: Utc::now() + Duration::days(ROBOT_CERTIFICATE_DAYS),
            poll_attempts: config.cert_poll_attempts,
            poll_backoff: config.cert_poll_backoff(),
        };
        let credentials =
            match issue_robot_credentials(self.keys.as_ref(), self.ca.as_ref(), team, robot, options).await {
                Ok(credentials) => credentials,
                Err(e) => {
                    warn!(team = %team, robot = %robot, error = %e, "robot credentials not issued, rolling back");
                    if let Err(cleanup) = self.inventory.delete_robot(team, robot).await {
                        warn!(team = %team, robot = %robot, error = %cleanup, "failed to roll back robot record");
                    }
                    return Err(e.into());
                }
            };

        self.audit(team, AuditResource::Robot, AuditAction::Created, json!({ "robot": robot }));
        self.audit(
            team,
            AuditResource::Certificate,
            AuditAction::Issued,
            json!({ "robot": robot, "serial": credentials.serial }),
        );
        Ok(credentials)
    }

    /// Delete a robot, skip its open associations and drop its keys from custody.
    pub async fn delete_robot(&self, team: &TeamId, robot: &RobotId) -> Result<()> {
        let ecus = self.inventory.ecus_for_robot(team, robot).await?;
        self.rollouts.delete_robot(team, robot).await?;

        let key_ids = ecus
            .into_iter()
            .map(|ecu| KeyId::Ecu {
                team: team.clone(),
                robot: robot.clone(),
                ecu: ecu.serial,
            })
            .chain([KeyId::Robot {
                team: team.clone(),
                robot: robot.clone(),
            }]);
        for id in key_ids {
            match self.keys.delete_key_pair(&id).await {
                Ok(()) | Err(CustodyError::KeyNotFound(_)) => {}
                Err(e) => warn!(key = %id, error = %e, "failed to delete robot key"),
            }
        }
        Ok(())
    }

    /// Register the ECUs of a robot and the public keys they sign with.
    pub async fn register_ecus(&self, team: &TeamId, robot: &RobotId, request: EcuRegistrationRequest) -> Result<()> {
        self.require_robot(team, robot).await?;

        if request.ecus.is_empty() {
            return Err(DirectorError::InvalidRequest("no ECUs to register".into()));
        }
        let serials: BTreeSet<_> = request.ecus.iter().map(|e| &e.ecu_serial).collect();
        if serials.len() != request.ecus.len() {
            return Err(DirectorError::InvalidRequest("duplicate ECU serial".into()));
        }
        if !serials.contains(&request.primary_ecu_serial) {
            return Err(DirectorError::InvalidRequest(format!(
                "primary ECU {} is not in the request",
                request.primary_ecu_serial
            )));
        }
        if !self.inventory.ecus_for_robot(team, robot).await?.is_empty() {
            return Err(DirectorError::Conflict(format!("Robot {} already registered its ECUs", robot)));
        }

        let mut keys = Vec::with_capacity(request.ecus.len());
        let mut ecus = Vec::with_capacity(request.ecus.len());
        for registration in request.ecus {
            let public = registration.client_key.public_key().map_err(|e| {
                DirectorError::InvalidRequest(format!("ECU {} key: {}", registration.ecu_serial, e))
            })?;
            keys.push((
                KeyId::Ecu {
                    team: team.clone(),
                    robot: robot.clone(),
                    ecu: registration.ecu_serial.clone(),
                },
                KeyPair::public_only(public.to_pem()),
            ));
            ecus.push(Ecu {
                team: team.clone(),
                robot: robot.clone(),
                primary: registration.ecu_serial == request.primary_ecu_serial,
                serial: registration.ecu_serial,
                hardware_id: registration.hardware_identifier,
                installed_image: None,
                status: None,
            });
        }

        let count = ecus.len();
        for (id, pair) in keys {
            self.keys.put_key_pair(&id, pair).await?;
        }
        self.inventory.insert_ecus(ecus).await?;

        info!(team = %team, robot = %robot, ecus = count, "registered ECUs");
        self.audit(team, AuditResource::Ecu, AuditAction::Registered, json!({ "robot": robot, "ecus": count }));
        Ok(())
    }

    pub async fn handle_manifest(&self, team: &TeamId, robot: &RobotId, raw: Value) -> Result<ManifestOutcome> {
        self.manifests.process(team, robot, raw).await
    }

    /// Queue a telemetry event for the rollout engine.
    pub async fn handle_telemetry(&self, team: &TeamId, robot: &RobotId, event: TelemetryEvent) -> Result<()> {
        self.require_robot(team, robot).await?;
        self.events.publish(Event::Telemetry {
            team: team.clone(),
            robot: robot.clone(),
            event,
        });
        Ok(())
    }

    /// A director document for `robot`: the latest one, or `version`.
    ///
    /// Root is shared by the team. Expired documents are still served.
    pub async fn fetch_metadata(
        &self,
        team: &TeamId,
        robot: &RobotId,
        role: Role,
        version: Option<u64>,
    ) -> Result<Metadata> {
        self.require_robot(team, robot).await?;
        let key = match role {
            Role::Root => MetadataKey::team_scoped(team.clone(), Repo::Director, Role::Root),
            _ => MetadataKey::director(team.clone(), role, robot.clone()),
        };
        self.fetch(&key, version).await
    }

    /// A document of the team's image repository.
    pub async fn fetch_image_metadata(&self, team: &TeamId, role: Role, version: Option<u64>) -> Result<Metadata> {
        let key = MetadataKey::team_scoped(team.clone(), Repo::Image, role);
        self.fetch(&key, version).await
    }

    async fn fetch(&self, key: &MetadataKey, version: Option<u64>) -> Result<Metadata> {
        let stored = match version {
            Some(version) => self.chains.store().by_version(key, version).await?,
            None => self.chains.store().latest(key).await?,
        };
        let stored = stored.ok_or_else(|| DirectorError::NotFound(format!("Metadata {}", key)))?;

        if version.is_none() && stored.expires_at <= Utc::now() {
            warn!(key = %key, version = stored.version, "serving expired metadata");
        }
        Ok(stored.document)
    }

    /// Status of a robot folded from its ECUs.
    pub async fn robot_status(&self, team: &TeamId, robot: &RobotId) -> Result<RobotStatus> {
        self.require_robot(team, robot).await?;
        let ecus = self.inventory.ecus_for_robot(team, robot).await?;
        Ok(fold_robot_status(ecus.into_iter().map(|e| e.status)))
    }

    async fn require_robot(&self, team: &TeamId, robot: &RobotId) -> Result<Robot> {
        self.inventory
            .get_robot(team, robot)
            .await?
            .ok_or_else(|| DirectorError::NotFound(format!("Robot {}", robot)))
    }

    fn audit(&self, team: &TeamId, resource: AuditResource, action: AuditAction, meta: Value) {
        self.events
            .publish(Event::Audit(AuditEvent::service(team, resource, action).with_meta(meta)));
    }
}
