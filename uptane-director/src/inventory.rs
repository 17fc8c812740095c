//! Fleet inventory: robots, ECUs, images, rollouts and received manifests.

use crate::store::{Result, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tokio::sync::RwLock;
use uptane_core::metadata::TargetFormat;
use uptane_core::{EcuSerial, HardwareId, RobotId, TeamId};

/// Image identifier (the target name in image and director targets)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImageId(pub String);

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Last status an ECU reported through telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EcuStatus {
    DownloadStarted,
    DownloadCompleted,
    DownloadFailed,
    InstallationStarted,
    InstallationApplied,
    InstallationCompleted,
    InstallationFailed,
}

impl EcuStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, EcuStatus::DownloadFailed | EcuStatus::InstallationFailed)
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            EcuStatus::DownloadStarted
                | EcuStatus::DownloadCompleted
                | EcuStatus::InstallationStarted
                | EcuStatus::InstallationApplied
        )
    }
}

/// Robot status derived from its ECUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotStatus {
    UpToDate,
    Updating,
    Failed,
}

/// Fold ECU statuses: any failure wins, then any update in progress.
pub fn fold_robot_status<I>(statuses: I) -> RobotStatus
where
    I: IntoIterator<Item = Option<EcuStatus>>,
{
    statuses
        .into_iter()
        .flatten()
        .fold(RobotStatus::UpToDate, |acc, status| match (acc, status) {
            (RobotStatus::Failed, _) => RobotStatus::Failed,
            (_, s) if s.is_failure() => RobotStatus::Failed,
            (_, s) if s.is_in_progress() => RobotStatus::Updating,
            (acc, _) => acc,
        })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Robot {
    pub team: TeamId,
    pub id: RobotId,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl Robot {
    pub fn new(team: TeamId, id: RobotId) -> Self {
        Self {
            team,
            id,
            deleted: false,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ecu {
    pub team: TeamId,
    pub robot: RobotId,
    pub serial: EcuSerial,
    pub hardware_id: HardwareId,
    pub primary: bool,
    pub installed_image: Option<ImageId>,
    pub status: Option<EcuStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub team: TeamId,
    pub id: ImageId,
    pub size: u64,
    pub sha256: String,
    pub sha512: Option<String>,
    pub format: TargetFormat,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Prepared,
    Launched,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rollout {
    pub team: TeamId,
    pub id: String,
    pub name: String,
    pub status: RolloutStatus,
    /// Image each matching hardware id should run
    pub hardware_images: BTreeMap<HardwareId, ImageId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutRobotStatus {
    Pending,
    Scheduled,
    Accepted,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl RolloutRobotStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RolloutRobotStatus::Completed
                | RolloutRobotStatus::Failed
                | RolloutRobotStatus::Skipped
                | RolloutRobotStatus::Cancelled
        )
    }

    /// Director metadata has been generated and not yet resolved.
    pub fn is_active(&self) -> bool {
        matches!(self, RolloutRobotStatus::Scheduled | RolloutRobotStatus::Accepted)
    }
}

/// Association of a robot with a rollout. Its id is the correlation id
/// written into the robot's director targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutRobot {
    pub id: String,
    pub rollout_id: String,
    pub team: TeamId,
    pub robot: RobotId,
    pub status: RolloutRobotStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutRobotEcu {
    pub rollout_robot_id: String,
    pub ecu: EcuSerial,
    pub hardware_id: HardwareId,
    pub image: ImageId,
    pub status: Option<EcuStatus>,
}

/// A manifest as received, valid or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub team: TeamId,
    pub robot: RobotId,
    pub raw: Value,
    pub valid: bool,
    /// Report counter of each ECU report, when the manifest parsed
    pub report_counters: BTreeMap<EcuSerial, u64>,
    pub received_at: DateTime<Utc>,
}

/// Persistence for the fleet inventory.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn create_robot(&self, robot: Robot) -> Result<()>;
    async fn get_robot(&self, team: &TeamId, robot: &RobotId) -> Result<Option<Robot>>;
    async fn list_robots(&self, team: &TeamId) -> Result<Vec<Robot>>;
    /// Soft-delete; associations referencing the robot are skipped later.
    async fn delete_robot(&self, team: &TeamId, robot: &RobotId) -> Result<()>;

    /// Insert ECUs, failing without writes if any already exists.
    async fn insert_ecus(&self, ecus: Vec<Ecu>) -> Result<()>;
    async fn ecus_for_robot(&self, team: &TeamId, robot: &RobotId) -> Result<Vec<Ecu>>;
    async fn update_ecu(&self, ecu: Ecu) -> Result<()>;

    async fn insert_image(&self, image: Image) -> Result<()>;
    async fn get_image(&self, team: &TeamId, image: &ImageId) -> Result<Option<Image>>;
    async fn delete_image(&self, team: &TeamId, image: &ImageId) -> Result<()>;

    async fn insert_rollout(&self, rollout: Rollout) -> Result<()>;
    async fn get_rollout(&self, team: &TeamId, rollout: &str) -> Result<Option<Rollout>>;
    async fn update_rollout(&self, rollout: Rollout) -> Result<()>;
    async fn list_rollouts(&self, team: &TeamId) -> Result<Vec<Rollout>>;
    async fn rollouts_with_status(&self, status: RolloutStatus) -> Result<Vec<Rollout>>;

    async fn insert_rollout_robots(&self, associations: Vec<RolloutRobot>) -> Result<()>;
    async fn get_rollout_robot(&self, id: &str) -> Result<Option<RolloutRobot>>;
    async fn rollout_robots(&self, rollout: &str) -> Result<Vec<RolloutRobot>>;
    async fn rollout_robots_for_robot(&self, team: &TeamId, robot: &RobotId) -> Result<Vec<RolloutRobot>>;
    async fn update_rollout_robot(&self, association: RolloutRobot) -> Result<()>;

    /// Replace the ECU records of an association.
    async fn put_rollout_robot_ecus(&self, association: &str, ecus: Vec<RolloutRobotEcu>) -> Result<()>;
    async fn rollout_robot_ecus(&self, association: &str) -> Result<Vec<RolloutRobotEcu>>;
    async fn update_rollout_robot_ecu(&self, record: RolloutRobotEcu) -> Result<()>;

    async fn insert_manifest(&self, record: ManifestRecord) -> Result<()>;
    async fn manifests_for_robot(&self, team: &TeamId, robot: &RobotId) -> Result<Vec<ManifestRecord>>;
}

#[derive(Debug, Default)]
struct Inventory {
    robots: BTreeMap<(TeamId, RobotId), Robot>,
    ecus: BTreeMap<(TeamId, RobotId, EcuSerial), Ecu>,
    images: BTreeMap<(TeamId, ImageId), Image>,
    rollouts: BTreeMap<String, Rollout>,
    rollout_robots: BTreeMap<String, RolloutRobot>,
    rollout_robot_ecus: HashMap<String, Vec<RolloutRobotEcu>>,
    manifests: Vec<ManifestRecord>,
}

/// Inventory held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryInventory {
    state: RwLock<Inventory>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventory {
    async fn create_robot(&self, robot: Robot) -> Result<()> {
        let mut state = self.state.write().await;
        let key = (robot.team.clone(), robot.id.clone());
        if state.robots.get(&key).is_some_and(|r| !r.deleted) {
            return Err(StoreError::AlreadyExists(format!("robot {}", robot.id)));
        }
        state.robots.insert(key, robot);
        Ok(())
    }

    async fn get_robot(&self, team: &TeamId, robot: &RobotId) -> Result<Option<Robot>> {
        Ok(self
            .state
            .read()
            .await
            .robots
            .get(&(team.clone(), robot.clone()))
            .filter(|r| !r.deleted)
            .cloned())
    }

    async fn list_robots(&self, team: &TeamId) -> Result<Vec<Robot>> {
        Ok(self
            .state
            .read()
            .await
            .robots
            .values()
            .filter(|r| &r.team == team && !r.deleted)
            .cloned()
            .collect())
    }

    async fn delete_robot(&self, team: &TeamId, robot: &RobotId) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .robots
            .get_mut(&(team.clone(), robot.clone()))
            .filter(|r| !r.deleted)
            .ok_or_else(|| StoreError::NotFound(format!("robot {}", robot)))?;
        entry.deleted = true;
        state
            .ecus
            .retain(|(t, r, _), _| !(t == team && r == robot));
        Ok(())
    }

    async fn insert_ecus(&self, ecus: Vec<Ecu>) -> Result<()> {
        let mut state = self.state.write().await;
        for ecu in &ecus {
            let key = (ecu.team.clone(), ecu.robot.clone(), ecu.serial.clone());
            if state.ecus.contains_key(&key) {
                return Err(StoreError::AlreadyExists(format!("ECU {}", ecu.serial)));
            }
        }
        for ecu in ecus {
            let key = (ecu.team.clone(), ecu.robot.clone(), ecu.serial.clone());
            state.ecus.insert(key, ecu);
        }
        Ok(())
    }

    async fn ecus_for_robot(&self, team: &TeamId, robot: &RobotId) -> Result<Vec<Ecu>> {
        Ok(self
            .state
            .read()
            .await
            .ecus
            .values()
            .filter(|e| &e.team == team && &e.robot == robot)
            .cloned()
            .collect())
    }

    async fn update_ecu(&self, ecu: Ecu) -> Result<()> {
        let mut state = self.state.write().await;
        let key = (ecu.team.clone(), ecu.robot.clone(), ecu.serial.clone());
        let entry = state
            .ecus
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("ECU {}", ecu.serial)))?;
        *entry = ecu;
        Ok(())
    }

    async fn insert_image(&self, image: Image) -> Result<()> {
        let mut state = self.state.write().await;
        let key = (image.team.clone(), image.id.clone());
        if state.images.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("image {}", image.id)));
        }
        state.images.insert(key, image);
        Ok(())
    }

    async fn get_image(&self, team: &TeamId, image: &ImageId) -> Result<Option<Image>> {
        Ok(self
            .state
            .read()
            .await
            .images
            .get(&(team.clone(), image.clone()))
            .cloned())
    }

    async fn delete_image(&self, team: &TeamId, image: &ImageId) -> Result<()> {
        self.state
            .write()
            .await
            .images
            .remove(&(team.clone(), image.clone()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("image {}", image)))
    }

    async fn insert_rollout(&self, rollout: Rollout) -> Result<()> {
        let mut state = self.state.write().await;
        if state.rollouts.contains_key(&rollout.id) {
            return Err(StoreError::AlreadyExists(format!("rollout {}", rollout.id)));
        }
        state.rollouts.insert(rollout.id.clone(), rollout);
        Ok(())
    }

    async fn get_rollout(&self, team: &TeamId, rollout: &str) -> Result<Option<Rollout>> {
        Ok(self
            .state
            .read()
            .await
            .rollouts
            .get(rollout)
            .filter(|r| &r.team == team)
            .cloned())
    }

    async fn update_rollout(&self, rollout: Rollout) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .rollouts
            .get_mut(&rollout.id)
            .ok_or_else(|| StoreError::NotFound(format!("rollout {}", rollout.id)))?;
        *entry = rollout;
        Ok(())
    }

    async fn list_rollouts(&self, team: &TeamId) -> Result<Vec<Rollout>> {
        Ok(self
            .state
            .read()
            .await
            .rollouts
            .values()
            .filter(|r| &r.team == team)
            .cloned()
            .collect())
    }

    async fn rollouts_with_status(&self, status: RolloutStatus) -> Result<Vec<Rollout>> {
        let mut rollouts: Vec<Rollout> = self
            .state
            .read()
            .await
            .rollouts
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        rollouts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rollouts)
    }

    async fn insert_rollout_robots(&self, associations: Vec<RolloutRobot>) -> Result<()> {
        let mut state = self.state.write().await;
        for association in associations {
            state
                .rollout_robots
                .insert(association.id.clone(), association);
        }
        Ok(())
    }

    async fn get_rollout_robot(&self, id: &str) -> Result<Option<RolloutRobot>> {
        Ok(self.state.read().await.rollout_robots.get(id).cloned())
    }

    async fn rollout_robots(&self, rollout: &str) -> Result<Vec<RolloutRobot>> {
        Ok(self
            .state
            .read()
            .await
            .rollout_robots
            .values()
            .filter(|a| a.rollout_id == rollout)
            .cloned()
            .collect())
    }

    async fn rollout_robots_for_robot(&self, team: &TeamId, robot: &RobotId) -> Result<Vec<RolloutRobot>> {
        Ok(self
            .state
            .read()
            .await
            .rollout_robots
            .values()
            .filter(|a| &a.team == team && &a.robot == robot)
            .cloned()
            .collect())
    }

    async fn update_rollout_robot(&self, association: RolloutRobot) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .rollout_robots
            .get_mut(&association.id)
            .ok_or_else(|| StoreError::NotFound(format!("rollout robot {}", association.id)))?;
        *entry = association;
        Ok(())
    }

    async fn put_rollout_robot_ecus(&self, association: &str, ecus: Vec<RolloutRobotEcu>) -> Result<()> {
        self.state
            .write()
            .await
            .rollout_robot_ecus
            .insert(association.to_string(), ecus);
        Ok(())
    }

    async fn rollout_robot_ecus(&self, association: &str) -> Result<Vec<RolloutRobotEcu>> {
        Ok(self
            .state
            .read()
            .await
            .rollout_robot_ecus
            .get(association)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_rollout_robot_ecu(&self, record: RolloutRobotEcu) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .rollout_robot_ecus
            .get_mut(&record.rollout_robot_id)
            .and_then(|records| records.iter_mut().find(|r| r.ecu == record.ecu))
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "ECU {} in rollout robot {}",
                    record.ecu, record.rollout_robot_id
                ))
            })?;
        *entry = record;
        Ok(())
    }

    async fn insert_manifest(&self, record: ManifestRecord) -> Result<()> {
        self.state.write().await.manifests.push(record);
        Ok(())
    }

    async fn manifests_for_robot(&self, team: &TeamId, robot: &RobotId) -> Result<Vec<ManifestRecord>> {
        Ok(self
            .state
            .read()
            .await
            .manifests
            .iter()
            .filter(|m| &m.team == team && &m.robot == robot)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn team() -> TeamId {
        TeamId("team-1".into())
    }

    fn ecu(robot: &str, serial: &str) -> Ecu {
        Ecu {
            team: team(),
            robot: RobotId(robot.into()),
            serial: EcuSerial(serial.into()),
            hardware_id: HardwareId("hw".into()),
            primary: serial == "P",
            installed_image: None,
            status: None,
        }
    }

    #[test]
    fn test_fold_robot_status() {
        use EcuStatus::*;

        assert_eq!(fold_robot_status([None, None]), RobotStatus::UpToDate);
        assert_eq!(
            fold_robot_status([Some(InstallationCompleted), Some(DownloadStarted)]),
            RobotStatus::Updating
        );
        assert_eq!(
            fold_robot_status([Some(InstallationFailed), Some(DownloadStarted)]),
            RobotStatus::Failed
        );
        assert_eq!(
            fold_robot_status([Some(DownloadStarted), Some(DownloadFailed), Some(InstallationApplied)]),
            RobotStatus::Failed
        );
    }

    #[test]
    fn test_status_wire_form() {
        assert_eq!(
            serde_json::to_string(&EcuStatus::InstallationCompleted).unwrap(),
            "\"installation_completed\""
        );
        assert!(RolloutRobotStatus::Skipped.is_terminal());
        assert!(!RolloutRobotStatus::Accepted.is_terminal());
    }

    #[tokio::test]
    async fn test_duplicate_ecus_rejected_atomically() {
        let inventory = InMemoryInventory::new();
        inventory.insert_ecus(vec![ecu("R-1", "P")]).await.unwrap();

        let result = inventory
            .insert_ecus(vec![ecu("R-1", "S"), ecu("R-1", "P")])
            .await;
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));

        let ecus = inventory
            .ecus_for_robot(&team(), &RobotId("R-1".into()))
            .await
            .unwrap();
        assert_eq!(ecus.len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_robot_is_hidden() {
        let inventory = InMemoryInventory::new();
        let robot = RobotId("R-1".into());
        inventory.create_robot(Robot::new(team(), robot.clone())).await.unwrap();
        inventory.insert_ecus(vec![ecu("R-1", "P")]).await.unwrap();

        inventory.delete_robot(&team(), &robot).await.unwrap();
        assert!(inventory.get_robot(&team(), &robot).await.unwrap().is_none());
        assert!(inventory.ecus_for_robot(&team(), &robot).await.unwrap().is_empty());
        assert!(inventory.delete_robot(&team(), &robot).await.is_err());
    }

    #[tokio::test]
    async fn test_update_missing_rollout_robot_ecu() {
        let inventory = InMemoryInventory::new();
        let record = RolloutRobotEcu {
            rollout_robot_id: "rr-1".into(),
            ecu: EcuSerial("S".into()),
            hardware_id: HardwareId("hw".into()),
            image: ImageId("img".into()),
            status: None,
        };
        assert!(inventory.update_rollout_robot_ecu(record.clone()).await.is_err());

        inventory
            .put_rollout_robot_ecus("rr-1", vec![record.clone()])
            .await
            .unwrap();
        let updated = RolloutRobotEcu {
            status: Some(EcuStatus::DownloadStarted),
            ..record
        };
        inventory.update_rollout_robot_ecu(updated.clone()).await.unwrap();
        assert_eq!(inventory.rollout_robot_ecus("rr-1").await.unwrap(), vec![updated]);
    }
}
