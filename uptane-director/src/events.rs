//! In-process event bus, audit events and robot telemetry.
//!
//! Side effects that cross module boundaries (auditing, telemetry, "this
//! robot needs director metadata") travel as [`Event`] messages. Delivery is
//! at-least-once: a [`Delivery`] that is dropped without [`Delivery::ack`] is
//! put back on the queue, and an event delivered `max_attempts` times without
//! being acknowledged is dead-lettered to the log.

use crate::inventory::EcuStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tracing::{error, info, warn};
use uptane_core::{EcuSerial, RobotId, TeamId};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Audit(AuditEvent),
    Telemetry {
        team: TeamId,
        robot: RobotId,
        event: TelemetryEvent,
    },
    /// The robot reported images that differ from its active rollout
    MetadataRequired { team: TeamId, robot: RobotId },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Audit(_) => "audit",
            Event::Telemetry { .. } => "telemetry",
            Event::MetadataRequired { .. } => "metadata_required",
        }
    }
}

#[derive(Debug)]
struct Envelope {
    event: Event,
    attempts: u32,
}

/// Create a bus. Events are dead-lettered after `max_attempts` deliveries.
pub fn channel(max_attempts: u32) -> (EventPublisher, EventSubscriber) {
    let (tx, rx) = mpsc::unbounded_channel();
    let requeue = tx.downgrade();
    (
        EventPublisher { tx },
        EventSubscriber {
            rx,
            requeue,
            max_attempts,
        },
    )
}

/// Sending half of the bus.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: UnboundedSender<Envelope>,
}

impl EventPublisher {
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        if self.tx.send(Envelope { event, attempts: 0 }).is_err() {
            warn!(kind, "event bus closed, dropping event");
        }
    }
}

/// Receiving half of the bus.
///
/// Holds only a weak sender for re-queueing, so the stream ends once every
/// publisher is gone and the queue is drained.
#[derive(Debug)]
pub struct EventSubscriber {
    rx: UnboundedReceiver<Envelope>,
    requeue: WeakUnboundedSender<Envelope>,
    max_attempts: u32,
}

impl EventSubscriber {
    /// Wait for the next deliverable event.
    pub async fn next(&mut self) -> Option<Delivery> {
        loop {
            let envelope = self.rx.recv().await?;
            if let Some(delivery) = self.admit(envelope) {
                return Some(delivery);
            }
        }
    }

    /// Next queued event, without waiting.
    pub fn try_next(&mut self) -> Option<Delivery> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) => {
                    if let Some(delivery) = self.admit(envelope) {
                        return Some(delivery);
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
            }
        }
    }

    fn admit(&self, envelope: Envelope) -> Option<Delivery> {
        let attempts = envelope.attempts + 1;
        if attempts > self.max_attempts {
            error!(
                kind = envelope.event.kind(),
                attempts = envelope.attempts,
                event = ?envelope.event,
                "dead-lettering event"
            );
            return None;
        }
        Some(Delivery {
            event: envelope.event,
            attempts,
            acked: false,
            requeue: self.requeue.clone(),
        })
    }
}

/// One delivery of an event. Re-queued on drop unless acknowledged.
#[derive(Debug)]
pub struct Delivery {
    event: Event,
    attempts: u32,
    acked: bool,
    requeue: WeakUnboundedSender<Envelope>,
}

impl Delivery {
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// 1 on first delivery.
    pub fn attempt(&self) -> u32 {
        self.attempts
    }

    pub fn ack(mut self) {
        self.acked = true;
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.acked {
            return;
        }
        let envelope = Envelope {
            event: self.event.clone(),
            attempts: self.attempts,
        };
        let sent = self
            .requeue
            .upgrade()
            .map(|tx| tx.send(envelope).is_ok())
            .unwrap_or(false);
        if !sent {
            warn!(kind = self.event.kind(), "event bus closed, dropping unacknowledged event");
        }
    }
}

// --- audit ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    Service,
    Robot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResource {
    Team,
    Robot,
    Ecu,
    Image,
    Rollout,
    RolloutRobot,
    Manifest,
    Metadata,
    Certificate,
}

/// Past-tense action taken on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    Deleted,
    Registered,
    Issued,
    Signed,
    Accepted,
    Rejected,
    Launched,
    Scheduled,
    Skipped,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub team: TeamId,
    pub actor_type: ActorType,
    pub actor_id: String,
    pub resource: AuditResource,
    pub action: AuditAction,
    pub meta: Option<Value>,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    /// Event raised by the service itself.
    pub fn service(team: &TeamId, resource: AuditResource, action: AuditAction) -> Self {
        Self {
            team: team.clone(),
            actor_type: ActorType::Service,
            actor_id: crate::SERVICE_ACTOR.to_string(),
            resource,
            action,
            meta: None,
            at: Utc::now(),
        }
    }

    /// Event raised by a robot request.
    pub fn robot(team: &TeamId, robot: &RobotId, resource: AuditResource, action: AuditAction) -> Self {
        Self {
            actor_type: ActorType::Robot,
            actor_id: robot.0.clone(),
            ..Self::service(team, resource, action)
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination of audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Writes audit events as `tracing` records on the `audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        info!(
            target: "audit",
            team = %event.team,
            actor_type = ?event.actor_type,
            actor_id = %event.actor_id,
            resource = ?event.resource,
            action = ?event.action,
            meta = ?event.meta,
            at = %event.at,
            "audit event"
        );
        Ok(())
    }
}

/// Keeps audit events in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

// --- telemetry ---

/// Event types reported by Aktualizr clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TelemetryKind {
    #[serde(rename = "campaign_accepted")]
    CampaignAccepted,
    #[serde(rename = "campaign_declined")]
    CampaignDeclined,
    #[serde(rename = "campaign_postponed")]
    CampaignPostponed,
    DevicePaused,
    DeviceResumed,
    EcuDownloadStarted,
    EcuDownloadCompleted,
    EcuInstallationStarted,
    EcuInstallationApplied,
    EcuInstallationCompleted,
    #[serde(other)]
    Unknown,
}

impl TelemetryKind {
    /// ECU status this event reports, if it reports one.
    pub fn ecu_status(&self, success: Option<bool>) -> Option<EcuStatus> {
        let succeeded = success.unwrap_or(true);
        match self {
            TelemetryKind::EcuDownloadStarted => Some(EcuStatus::DownloadStarted),
            TelemetryKind::EcuDownloadCompleted if succeeded => Some(EcuStatus::DownloadCompleted),
            TelemetryKind::EcuDownloadCompleted => Some(EcuStatus::DownloadFailed),
            TelemetryKind::EcuInstallationStarted => Some(EcuStatus::InstallationStarted),
            TelemetryKind::EcuInstallationApplied => Some(EcuStatus::InstallationApplied),
            TelemetryKind::EcuInstallationCompleted if succeeded => Some(EcuStatus::InstallationCompleted),
            TelemetryKind::EcuInstallationCompleted => Some(EcuStatus::InstallationFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEventType {
    pub id: TelemetryKind,
    pub version: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    /// Id of the rollout robot association the robot is acting on
    #[serde(rename = "correlationId", default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub ecu: Option<EcuSerial>,
    #[serde(default)]
    pub success: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub id: String,
    #[serde(rename = "deviceTime")]
    pub device_time: String,
    #[serde(rename = "eventType")]
    pub event_type: TelemetryEventType,
    pub event: TelemetryPayload,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata_required(robot: &str) -> Event {
        Event::MetadataRequired {
            team: TeamId("team-1".into()),
            robot: RobotId(robot.into()),
        }
    }

    #[tokio::test]
    async fn test_acked_delivery_is_consumed() {
        let (publisher, mut subscriber) = channel(3);
        publisher.publish(metadata_required("R-1"));

        let delivery = subscriber.next().await.unwrap();
        assert_eq!(delivery.attempt(), 1);
        delivery.ack();

        assert!(subscriber.try_next().is_none());
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_requeued_then_dead_lettered() {
        let (publisher, mut subscriber) = channel(2);
        publisher.publish(metadata_required("R-1"));

        let first = subscriber.try_next().unwrap();
        assert_eq!(first.attempt(), 1);
        drop(first);

        let second = subscriber.try_next().unwrap();
        assert_eq!(second.attempt(), 2);
        assert_eq!(second.event(), &metadata_required("R-1"));
        drop(second);

        // third delivery exceeds the limit
        assert!(subscriber.try_next().is_none());
    }

    #[tokio::test]
    async fn test_stream_ends_when_publishers_are_gone() {
        let (publisher, mut subscriber) = channel(1);
        publisher.publish(metadata_required("R-1"));
        drop(publisher);

        subscriber.next().await.unwrap().ack();
        assert!(subscriber.next().await.is_none());
    }

    #[test]
    fn test_telemetry_wire_form() {
        let raw = json!({
            "id": "evt-1",
            "deviceTime": "2023-01-01T00:00:00Z",
            "eventType": {"id": "EcuInstallationCompleted", "version": 0},
            "event": {"correlationId": "rr-1", "ecu": "S", "success": false}
        });
        let event: TelemetryEvent = serde_json::from_value(raw).unwrap();

        assert_eq!(event.event_type.id, TelemetryKind::EcuInstallationCompleted);
        assert_eq!(event.event.correlation_id.as_deref(), Some("rr-1"));
        assert_eq!(
            event.event_type.id.ecu_status(event.event.success),
            Some(EcuStatus::InstallationFailed)
        );
    }

    #[test]
    fn test_telemetry_kinds() {
        let kind: TelemetryKind = serde_json::from_value(json!("campaign_accepted")).unwrap();
        assert_eq!(kind, TelemetryKind::CampaignAccepted);
        assert_eq!(kind.ecu_status(None), None);

        let kind: TelemetryKind = serde_json::from_value(json!("SomethingNew")).unwrap();
        assert_eq!(kind, TelemetryKind::Unknown);

        assert_eq!(
            TelemetryKind::EcuDownloadCompleted.ecu_status(Some(true)),
            Some(EcuStatus::DownloadCompleted)
        );
    }

    #[tokio::test]
    async fn test_memory_sink_records() {
        let sink = MemoryAuditSink::new();
        let team = TeamId("team-1".into());
        let event = AuditEvent::robot(&team, &RobotId("R-1".into()), AuditResource::Manifest, AuditAction::Accepted);
        sink.record(&event).await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor_type, ActorType::Robot);
        assert_eq!(events[0].actor_id, "R-1");
    }
}
