//! Rollout processing.
//!
//! A launched rollout moves each of its robot associations through
//! `pending -> scheduled -> accepted -> completed | failed`, with `skipped`
//! and `cancelled` as side exits. Scheduling an association writes the
//! robot's director targets with the association id as correlation id, which
//! robots echo back in their telemetry.
//!
//! Both passes only act on associations whose state calls for it, so running
//! them again with nothing new to observe writes nothing.

use crate::chain::ChainWriter;
use crate::error::{DirectorError, Result};
use crate::events::{AuditAction, AuditEvent, AuditResource, Event, EventPublisher, TelemetryEvent};
use crate::inventory::{
    Ecu, EcuStatus, Image, ImageId, InventoryStore, Rollout, RolloutRobot, RolloutRobotEcu,
    RolloutRobotStatus, RolloutStatus,
};
use crate::store::{KeyedLocks, MetadataKey};
use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uptane_core::metadata::TargetBuilder;
use uptane_core::{HardwareId, RobotId, Role, TargetEntry, TeamId};
use uuid::Uuid;

/// Which robots a new rollout covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutTargets {
    /// Every robot with an ECU of one of the rollout's hardware ids
    HardwareIds,
    /// Exactly these robots
    Selected(Vec<RobotId>),
}

/// Counts from one pass, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub scheduled: usize,
    pub accepted: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub rollouts_completed: usize,
}

impl PassSummary {
    pub fn is_empty(&self) -> bool {
        *self == PassSummary::default()
    }
}

pub struct RolloutEngine {
    inventory: Arc<dyn InventoryStore>,
    chains: Arc<ChainWriter>,
    events: EventPublisher,
    robot_locks: KeyedLocks<(TeamId, RobotId)>,
}

impl RolloutEngine {
    pub fn new(inventory: Arc<dyn InventoryStore>, chains: Arc<ChainWriter>, events: EventPublisher) -> Self {
        Self {
            inventory,
            chains,
            events,
            robot_locks: KeyedLocks::new(),
        }
    }

    /// Create a prepared rollout and its pending associations.
    pub async fn create_rollout(
        &self,
        team: &TeamId,
        name: &str,
        hardware_images: BTreeMap<HardwareId, ImageId>,
        targets: RolloutTargets,
    ) -> Result<Rollout> {
        if hardware_images.is_empty() {
            return Err(DirectorError::InvalidRequest("rollout maps no hardware ids".into()));
        }
        for image in hardware_images.values() {
            if self.inventory.get_image(team, image).await?.is_none() {
                return Err(DirectorError::NotFound(format!("Image {}", image)));
            }
        }

        let robots = match targets {
            RolloutTargets::HardwareIds => {
                let mut matching = Vec::new();
                for robot in self.inventory.list_robots(team).await? {
                    let ecus = self.inventory.ecus_for_robot(team, &robot.id).await?;
                    if ecus.iter().any(|e| hardware_images.contains_key(&e.hardware_id)) {
                        matching.push(robot.id);
                    }
                }
                matching
            }
            RolloutTargets::Selected(robots) => {
                let robots: BTreeSet<RobotId> = robots.into_iter().collect();
                for robot in &robots {
                    if self.inventory.get_robot(team, robot).await?.is_none() {
                        return Err(DirectorError::NotFound(format!("Robot {}", robot)));
                    }
                }
                robots.into_iter().collect()
            }
        };

        let now = Utc::now();
        let rollout = Rollout {
            team: team.clone(),
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            status: RolloutStatus::Prepared,
            hardware_images,
            created_at: now,
        };
        let associations = robots
            .into_iter()
            .map(|robot| RolloutRobot {
                id: Uuid::new_v4().to_string(),
                rollout_id: rollout.id.clone(),
                team: team.clone(),
                robot,
                status: RolloutRobotStatus::Pending,
                created_at: now,
            })
            .collect::<Vec<_>>();

        self.inventory.insert_rollout(rollout.clone()).await?;
        let robot_count = associations.len();
        self.inventory.insert_rollout_robots(associations).await?;

        info!(team = %team, rollout = %rollout.id, robots = robot_count, "created rollout");
        self.audit(team, AuditResource::Rollout, AuditAction::Created, json!({ "rollout": rollout.id }));
        Ok(rollout)
    }

    pub async fn launch_rollout(&self, team: &TeamId, rollout_id: &str) -> Result<Rollout> {
        let mut rollout = self.rollout(team, rollout_id).await?;
        if rollout.status != RolloutStatus::Prepared {
            return Err(DirectorError::Conflict(format!(
                "Rollout {} cannot be launched from {:?}",
                rollout_id, rollout.status
            )));
        }
        rollout.status = RolloutStatus::Launched;
        self.inventory.update_rollout(rollout.clone()).await?;

        info!(team = %team, rollout = %rollout_id, "launched rollout");
        self.audit(team, AuditResource::Rollout, AuditAction::Launched, json!({ "rollout": rollout_id }));
        Ok(rollout)
    }

    /// Cancel a rollout that has not finished.
    ///
    /// Robots that already received director targets for it get empty targets.
    pub async fn cancel_rollout(&self, team: &TeamId, rollout_id: &str) -> Result<Rollout> {
        let mut rollout = self.rollout(team, rollout_id).await?;
        if matches!(rollout.status, RolloutStatus::Completed | RolloutStatus::Cancelled) {
            return Err(DirectorError::Conflict(format!(
                "Rollout {} is already {:?}",
                rollout_id, rollout.status
            )));
        }
        rollout.status = RolloutStatus::Cancelled;
        self.inventory.update_rollout(rollout.clone()).await?;

        for mut association in self.inventory.rollout_robots(rollout_id).await? {
            if association.status.is_terminal() {
                continue;
            }
            let _guard = self
                .robot_locks
                .lock((team.clone(), association.robot.clone()))
                .await;
            if association.status.is_active() {
                self.chains
                    .write_director_targets(team, &association.robot, BTreeMap::new(), None)
                    .await?;
            }
            association.status = RolloutRobotStatus::Cancelled;
            self.inventory.update_rollout_robot(association).await?;
        }

        info!(team = %team, rollout = %rollout_id, "cancelled rollout");
        self.audit(team, AuditResource::Rollout, AuditAction::Cancelled, json!({ "rollout": rollout_id }));
        Ok(rollout)
    }

    /// Delete an image unless a rollout that has not finished with it uses it.
    pub async fn delete_image(&self, team: &TeamId, image: &ImageId) -> Result<()> {
        if self.inventory.get_image(team, image).await?.is_none() {
            return Err(DirectorError::NotFound(format!("Image {}", image)));
        }
        for rollout in self.inventory.list_rollouts(team).await? {
            if !rollout.hardware_images.values().any(|i| i == image) {
                continue;
            }
            let associations = self.inventory.rollout_robots(&rollout.id).await?;
            if associations.iter().any(|a| !a.status.is_terminal()) {
                return Err(DirectorError::Conflict(format!(
                    "Image {} is referenced by rollout {}",
                    image, rollout.id
                )));
            }
        }

        self.chains.withdraw_image_target(team, &image.0).await?;
        self.inventory.delete_image(team, image).await?;
        info!(team = %team, image = %image, "deleted image");
        self.audit(team, AuditResource::Image, AuditAction::Deleted, json!({ "image": image }));
        Ok(())
    }

    /// Delete a robot. Its unfinished associations are skipped.
    pub async fn delete_robot(&self, team: &TeamId, robot: &RobotId) -> Result<()> {
        let _guard = self.robot_locks.lock((team.clone(), robot.clone())).await;
        self.inventory.delete_robot(team, robot).await?;

        for mut association in self.inventory.rollout_robots_for_robot(team, robot).await? {
            if !association.status.is_terminal() {
                association.status = RolloutRobotStatus::Skipped;
                self.inventory.update_rollout_robot(association).await?;
            }
        }

        info!(team = %team, robot = %robot, "deleted robot");
        self.audit(team, AuditResource::Robot, AuditAction::Deleted, json!({ "robot": robot }));
        Ok(())
    }

    /// Schedule or skip every pending association of every launched rollout.
    pub async fn process_pending(&self) -> Result<PassSummary> {
        let mut summary = PassSummary::default();
        let launched = self.inventory.rollouts_with_status(RolloutStatus::Launched).await?;

        for rollout in &launched {
            for association in self.inventory.rollout_robots(&rollout.id).await? {
                if association.status != RolloutRobotStatus::Pending {
                    continue;
                }
                let id = association.id.clone();
                match self.process_pending_robot(rollout, &launched, association).await {
                    Ok(RolloutRobotStatus::Scheduled) => summary.scheduled += 1,
                    Ok(RolloutRobotStatus::Skipped) => summary.skipped += 1,
                    Ok(_) => {}
                    Err(e) => error!(rollout = %rollout.id, association = %id, error = %e, "failed to process association"),
                }
            }
        }
        Ok(summary)
    }

    async fn process_pending_robot(
        &self,
        rollout: &Rollout,
        launched: &[Rollout],
        mut association: RolloutRobot,
    ) -> Result<RolloutRobotStatus> {
        let team = &rollout.team;
        let robot = association.robot.clone();
        let _guard = self.robot_locks.lock((team.clone(), robot.clone())).await;

        // re-read under the lock
        match self.inventory.get_rollout_robot(&association.id).await? {
            Some(current) if current.status == RolloutRobotStatus::Pending => association = current,
            _ => return Ok(RolloutRobotStatus::Pending),
        }

        if self.inventory.get_robot(team, &robot).await?.is_none() {
            debug!(association = %association.id, "robot deleted, skipping");
            return self.transition(association, RolloutRobotStatus::Skipped).await;
        }

        if self.superseded(rollout, launched, &association).await? {
            info!(robot = %robot, rollout = %rollout.id, "robot is pending in a newer rollout, skipping");
            return self.transition(association, RolloutRobotStatus::Skipped).await;
        }

        let mut affected: Vec<(Ecu, Image)> = Vec::new();
        for ecu in self.inventory.ecus_for_robot(team, &robot).await? {
            let Some(image_id) = rollout.hardware_images.get(&ecu.hardware_id) else {
                continue;
            };
            if ecu.installed_image.as_ref() == Some(image_id) {
                continue;
            }
            match self.inventory.get_image(team, image_id).await? {
                Some(image) => affected.push((ecu, image)),
                None => error!(rollout = %rollout.id, image = %image_id, "rollout image has been deleted"),
            }
        }

        if affected.is_empty() {
            debug!(robot = %robot, rollout = %rollout.id, "robot not affected by rollout");
            return self.transition(association, RolloutRobotStatus::Skipped).await;
        }

        let records: Vec<RolloutRobotEcu> = affected
            .iter()
            .map(|(ecu, image)| RolloutRobotEcu {
                rollout_robot_id: association.id.clone(),
                ecu: ecu.serial.clone(),
                hardware_id: ecu.hardware_id.clone(),
                image: image.id.clone(),
                status: None,
            })
            .collect();
        self.inventory
            .put_rollout_robot_ecus(&association.id, records)
            .await?;
        // an earlier attempt may have signed before failing
        if !self.carries_correlation(team, &robot, &association.id).await? {
            let targets = self.director_targets(&affected)?;
            self.chains
                .write_director_targets(team, &robot, targets, Some(association.id.clone()))
                .await?;
        }

        // the robot now follows this rollout only
        for mut other in self.inventory.rollout_robots_for_robot(team, &robot).await? {
            if other.id != association.id && other.status.is_active() {
                info!(robot = %robot, association = %other.id, "superseded by newer rollout");
                other.status = RolloutRobotStatus::Skipped;
                self.inventory.update_rollout_robot(other).await?;
            }
        }

        self.transition(association, RolloutRobotStatus::Scheduled).await
    }

    /// Whether the robot is also pending in a launched rollout newer than `rollout`.
    async fn superseded(
        &self,
        rollout: &Rollout,
        launched: &[Rollout],
        association: &RolloutRobot,
    ) -> Result<bool> {
        let newer: BTreeSet<&str> = launched
            .iter()
            .filter(|r| r.id != rollout.id && (r.created_at, &r.id) > (rollout.created_at, &rollout.id))
            .map(|r| r.id.as_str())
            .collect();
        if newer.is_empty() {
            return Ok(false);
        }
        Ok(self
            .inventory
            .rollout_robots_for_robot(&association.team, &association.robot)
            .await?
            .iter()
            .any(|a| a.status == RolloutRobotStatus::Pending && newer.contains(a.rollout_id.as_str())))
    }

    /// Advance scheduled and accepted associations from their ECU reports,
    /// and complete rollouts whose associations are all done.
    pub async fn process_statuses(&self) -> Result<PassSummary> {
        let mut summary = PassSummary::default();

        for mut rollout in self.inventory.rollouts_with_status(RolloutStatus::Launched).await? {
            let mut done = true;
            for association in self.inventory.rollout_robots(&rollout.id).await? {
                let id = association.id.clone();
                let status = match self.advance(association).await {
                    Ok(status) => status,
                    Err(e) => {
                        error!(rollout = %rollout.id, association = %id, error = %e, "failed to advance association");
                        done = false;
                        continue;
                    }
                };
                match status {
                    RolloutRobotStatus::Accepted => summary.accepted += 1,
                    RolloutRobotStatus::Completed => summary.completed += 1,
                    RolloutRobotStatus::Failed => summary.failed += 1,
                    RolloutRobotStatus::Skipped => summary.skipped += 1,
                    _ => {}
                }
            }

            let associations = self.inventory.rollout_robots(&rollout.id).await?;
            done &= associations.iter().all(|a| {
                matches!(a.status, RolloutRobotStatus::Skipped | RolloutRobotStatus::Completed)
            });
            if done {
                rollout.status = RolloutStatus::Completed;
                self.inventory.update_rollout(rollout.clone()).await?;
                summary.rollouts_completed += 1;
                info!(team = %rollout.team, rollout = %rollout.id, "rollout completed");
                self.audit(
                    &rollout.team,
                    AuditResource::Rollout,
                    AuditAction::Completed,
                    json!({ "rollout": rollout.id }),
                );
            }
        }
        Ok(summary)
    }

    /// Move one association forward if its ECU reports allow it. Returns the
    /// status it changed to, or `Pending` when nothing changed.
    async fn advance(&self, association: RolloutRobot) -> Result<RolloutRobotStatus> {
        if association.status.is_terminal() || association.status == RolloutRobotStatus::Pending {
            return Ok(RolloutRobotStatus::Pending);
        }
        let team = association.team.clone();
        let robot = association.robot.clone();
        let _guard = self.robot_locks.lock((team.clone(), robot.clone())).await;

        let mut association = match self.inventory.get_rollout_robot(&association.id).await? {
            Some(current) if current.status.is_active() => current,
            _ => return Ok(RolloutRobotStatus::Pending),
        };

        if self.inventory.get_robot(&team, &robot).await?.is_none() {
            return self.transition(association, RolloutRobotStatus::Skipped).await;
        }

        let ecus = self.inventory.rollout_robot_ecus(&association.id).await?;
        let mut changed = RolloutRobotStatus::Pending;

        if association.status == RolloutRobotStatus::Scheduled {
            if ecus.is_empty() || ecus.iter().any(|e| e.status.is_none()) {
                return Ok(changed);
            }
            association.status = RolloutRobotStatus::Accepted;
            self.inventory.update_rollout_robot(association.clone()).await?;
            self.audit_association(&association, AuditAction::Accepted);
            changed = RolloutRobotStatus::Accepted;
        }

        if ecus.iter().any(|e| e.status.is_some_and(|s| s.is_failure())) {
            return self.transition(association, RolloutRobotStatus::Failed).await;
        }
        if ecus
            .iter()
            .all(|e| e.status == Some(EcuStatus::InstallationCompleted))
        {
            return self.transition(association, RolloutRobotStatus::Completed).await;
        }
        Ok(changed)
    }

    /// Apply a telemetry event reported by a robot.
    pub async fn handle_telemetry(&self, team: &TeamId, robot: &RobotId, event: &TelemetryEvent) -> Result<()> {
        let kind = event.event_type.id;
        let Some(status) = kind.ecu_status(event.event.success) else {
            info!(team = %team, robot = %robot, kind = ?kind, "telemetry event");
            return Ok(());
        };
        let (Some(correlation_id), Some(serial)) = (&event.event.correlation_id, &event.event.ecu) else {
            warn!(team = %team, robot = %robot, kind = ?kind, "telemetry event without correlation id or ECU");
            return Ok(());
        };

        let _guard = self.robot_locks.lock((team.clone(), robot.clone())).await;

        let association = match self.inventory.get_rollout_robot(correlation_id).await? {
            Some(a) if &a.team == team && &a.robot == robot => a,
            _ => {
                warn!(team = %team, robot = %robot, correlation_id = %correlation_id, "telemetry for unknown rollout robot");
                return Ok(());
            }
        };

        let records = self.inventory.rollout_robot_ecus(&association.id).await?;
        let Some(mut record) = records.into_iter().find(|r| &r.ecu == serial) else {
            warn!(correlation_id = %correlation_id, ecu = %serial, "ECU is not part of the rollout");
            return Ok(());
        };
        record.status = Some(status);
        self.inventory.update_rollout_robot_ecu(record.clone()).await?;

        let ecus = self.inventory.ecus_for_robot(team, robot).await?;
        if let Some(mut ecu) = ecus.into_iter().find(|e| &e.serial == serial) {
            ecu.status = Some(status);
            if status == EcuStatus::InstallationCompleted {
                ecu.installed_image = Some(record.image.clone());
            }
            self.inventory.update_ecu(ecu).await?;
        }

        debug!(correlation_id = %correlation_id, ecu = %serial, status = ?status, "recorded ECU status");
        Ok(())
    }

    /// Make sure the robot's director targets belong to its active rollout.
    ///
    /// Returns `true` if new metadata was written.
    pub async fn ensure_director_metadata(&self, team: &TeamId, robot: &RobotId) -> Result<bool> {
        let _guard = self.robot_locks.lock((team.clone(), robot.clone())).await;

        let active = self
            .inventory
            .rollout_robots_for_robot(team, robot)
            .await?
            .into_iter()
            .filter(|a| a.status.is_active())
            .max_by(|a, b| a.created_at.cmp(&b.created_at));
        let Some(active) = active else {
            debug!(team = %team, robot = %robot, "no active rollout");
            return Ok(false);
        };

        if self.carries_correlation(team, robot, &active.id).await? {
            debug!(team = %team, robot = %robot, "director metadata is current");
            return Ok(false);
        }

        let ecus = self.inventory.ecus_for_robot(team, robot).await?;
        let mut affected = Vec::new();
        for record in self.inventory.rollout_robot_ecus(&active.id).await? {
            let Some(ecu) = ecus.iter().find(|e| e.serial == record.ecu) else {
                continue;
            };
            if let Some(image) = self.inventory.get_image(team, &record.image).await? {
                affected.push((ecu.clone(), image));
            }
        }
        let targets = self.director_targets(&affected)?;
        self.chains
            .write_director_targets(team, robot, targets, Some(active.id.clone()))
            .await?;
        info!(team = %team, robot = %robot, association = %active.id, "regenerated director metadata");
        Ok(true)
    }

    /// Whether the robot's latest director targets were written for `association`.
    async fn carries_correlation(&self, team: &TeamId, robot: &RobotId, association: &str) -> Result<bool> {
        let key = MetadataKey::director(team.clone(), Role::Targets, robot.clone());
        let current = self.chains.store().latest(&key).await?;
        Ok(current
            .as_ref()
            .and_then(|m| m.document.as_targets())
            .and_then(|t| t.signed.custom.as_ref())
            .is_some_and(|c| c.correlation_id == association))
    }

    /// Director target entries assigning each image to its ECUs.
    fn director_targets(&self, affected: &[(Ecu, Image)]) -> Result<BTreeMap<String, TargetEntry>> {
        let mut builders: BTreeMap<&ImageId, TargetBuilder> = BTreeMap::new();
        for (ecu, image) in affected {
            let builder = builders.remove(&image.id).unwrap_or_else(|| {
                TargetBuilder::new()
                    .length(image.size)
                    .sha256(image.sha256.clone())
                    .sha512(image.sha512.clone())
                    .format(image.format)
                    .uri(self.chains.config().image_uri(&image.id.0))
            });
            builders.insert(&image.id, builder.ecu(ecu.serial.clone(), ecu.hardware_id.clone()));
        }

        builders
            .into_iter()
            .map(|(id, builder)| Ok((id.0.clone(), builder.build()?)))
            .collect()
    }

    async fn rollout(&self, team: &TeamId, rollout_id: &str) -> Result<Rollout> {
        self.inventory
            .get_rollout(team, rollout_id)
            .await?
            .ok_or_else(|| DirectorError::NotFound(format!("Rollout {}", rollout_id)))
    }

    async fn transition(&self, mut association: RolloutRobot, status: RolloutRobotStatus) -> Result<RolloutRobotStatus> {
        association.status = status;
        self.inventory.update_rollout_robot(association.clone()).await?;

        let action = match status {
            RolloutRobotStatus::Scheduled => Some(AuditAction::Scheduled),
            RolloutRobotStatus::Accepted => Some(AuditAction::Accepted),
            RolloutRobotStatus::Completed => Some(AuditAction::Completed),
            RolloutRobotStatus::Failed => Some(AuditAction::Failed),
            RolloutRobotStatus::Skipped => Some(AuditAction::Skipped),
            RolloutRobotStatus::Cancelled => Some(AuditAction::Cancelled),
            RolloutRobotStatus::Pending => None,
        };
        if let Some(action) = action {
            self.audit_association(&association, action);
        }
        Ok(status)
    }

    fn audit_association(&self, association: &RolloutRobot, action: AuditAction) {
        self.audit(
            &association.team,
            AuditResource::RolloutRobot,
            action,
            json!({
                "rollout": association.rollout_id,
                "robot": association.robot,
                "association": association.id,
            }),
        );
    }

    fn audit(&self, team: &TeamId, resource: AuditResource, action: AuditAction, meta: serde_json::Value) {
        self.events
            .publish(Event::Audit(AuditEvent::service(team, resource, action).with_meta(meta)));
    }
}
