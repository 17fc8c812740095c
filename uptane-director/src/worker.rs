//! Background workers: periodic passes and the event dispatcher.

use crate::custody::CertificateAuthority;
use crate::events::{AuditSink, Delivery, Event, EventSubscriber};
use crate::resigner::Resigner;
use crate::rollout::RolloutEngine;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Run `tick` every `period` until `shutdown` flips to true.
///
/// Ticks never overlap: a tick that outlasts the period delays the next one
/// instead of running concurrently with it.
pub async fn every<F, Fut>(name: &'static str, period: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(worker = name, period_secs = period.as_secs(), "worker started");

    loop {
        tokio::select! {
            _ = ticker.tick() => tick().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!(worker = name, "worker stopped");
}

pub async fn run_resigner(resigner: Resigner, period: Duration, shutdown: watch::Receiver<bool>) {
    let resigner = &resigner;
    every("resign", period, shutdown, || async move {
        if let Err(e) = resigner.run_once(Utc::now()).await {
            error!(error = %e, "re-signing pass failed");
        }
    })
    .await
}

pub async fn run_rollouts(engine: Arc<RolloutEngine>, period: Duration, shutdown: watch::Receiver<bool>) {
    let engine = &engine;
    every("rollout", period, shutdown, || async move {
        match engine.process_pending().await {
            Ok(summary) if !summary.is_empty() => info!(?summary, "pending pass"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "pending pass failed"),
        }
        match engine.process_statuses().await {
            Ok(summary) if !summary.is_empty() => info!(?summary, "status pass"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "status pass failed"),
        }
    })
    .await
}

pub async fn run_certificate_purge(
    ca: Arc<dyn CertificateAuthority>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
) {
    let ca = &ca;
    every("certificate_purge", period, shutdown, || async move {
        match ca.purge_expired(Utc::now()).await {
            Ok(0) => {}
            Ok(purged) => info!(purged, "marked expired certificates"),
            Err(e) => error!(error = %e, "certificate purge failed"),
        }
    })
    .await
}

/// Routes bus events to their handlers.
pub struct EventDispatcher {
    rollouts: Arc<RolloutEngine>,
    audit: Arc<dyn AuditSink>,
    retry_delay: Duration,
}

impl EventDispatcher {
    pub fn new(rollouts: Arc<RolloutEngine>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            rollouts,
            audit,
            retry_delay: Duration::from_millis(500),
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Handle events until every publisher is gone.
    pub async fn run(self, mut subscriber: EventSubscriber) {
        info!("event dispatcher started");
        while let Some(delivery) = subscriber.next().await {
            self.dispatch(delivery).await;
        }
        info!("event bus closed, dispatcher stopped");
    }

    /// Handle one delivery. Acknowledged on success; on failure it is
    /// dropped after a delay, which puts it back on the queue.
    pub async fn dispatch(&self, delivery: Delivery) {
        let result = match delivery.event() {
            Event::Audit(event) => self.audit.record(event).await.map_err(|e| e.to_string()),
            Event::Telemetry { team, robot, event } => self
                .rollouts
                .handle_telemetry(team, robot, event)
                .await
                .map_err(|e| e.to_string()),
            Event::MetadataRequired { team, robot } => self
                .rollouts
                .ensure_director_metadata(team, robot)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
        };

        match result {
            Ok(()) => {
                debug!(kind = delivery.event().kind(), "event handled");
                delivery.ack();
            }
            Err(e) => {
                warn!(
                    kind = delivery.event().kind(),
                    attempt = delivery.attempt(),
                    error = %e,
                    "event handler failed, retrying"
                );
                tokio::time::sleep(self.retry_delay * delivery.attempt()).await;
                drop(delivery);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::director::test_support::director;
    use crate::events::{channel, AuditAction, AuditError, AuditEvent, AuditResource, MemoryAuditSink};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uptane_core::{RobotId, TeamId};

    struct FailingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn record(&self, _event: &AuditEvent) -> Result<(), AuditError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AuditError::Unavailable("down".into()))
        }
    }

    fn team() -> TeamId {
        TeamId("team-1".into())
    }

    fn audit_event() -> Event {
        Event::Audit(AuditEvent::service(&team(), AuditResource::Team, AuditAction::Created))
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_runs_until_shutdown() {
        let (tx, rx) = watch::channel(false);
        let count = Arc::new(AtomicUsize::new(0));
        let ticks = count.clone();

        let handle = tokio::spawn(async move {
            every("test", Duration::from_secs(10), rx, || {
                let ticks = ticks.clone();
                async move {
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
        });

        // first tick fires immediately, then at 10s and 20s
        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_audit_events_reach_sink() {
        let (director, _) = director(&team()).await;
        let sink = Arc::new(MemoryAuditSink::new());
        let dispatcher = EventDispatcher::new(director.rollouts().clone(), sink.clone());

        let (publisher, mut subscriber) = channel(3);
        publisher.publish(audit_event());
        let delivery = subscriber.try_next().unwrap();
        dispatcher.dispatch(delivery).await;

        assert_eq!(sink.events().len(), 1);
        assert!(subscriber.try_next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_handler_retries_then_dead_letters() {
        let (director, _) = director(&team()).await;
        let sink = Arc::new(FailingSink {
            calls: AtomicUsize::new(0),
        });
        let dispatcher = EventDispatcher::new(director.rollouts().clone(), sink.clone())
            .with_retry_delay(Duration::from_millis(10));

        let (publisher, mut subscriber) = channel(2);
        publisher.publish(audit_event());
        while let Some(delivery) = subscriber.try_next() {
            dispatcher.dispatch(delivery).await;
        }
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_metadata_required_without_rollout_is_acked() {
        let (director, _) = director(&team()).await;
        let dispatcher = EventDispatcher::new(director.rollouts().clone(), Arc::new(MemoryAuditSink::new()));

        let (publisher, subscriber) = channel(3);
        publisher.publish(Event::MetadataRequired {
            team: team(),
            robot: RobotId("R-1".into()),
        });
        drop(publisher);

        // an unacknowledged event would be re-queued and keep the loop alive
        tokio::time::timeout(Duration::from_secs(5), dispatcher.run(subscriber))
            .await
            .unwrap();
    }
}
