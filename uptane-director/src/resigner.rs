//! Re-signing of metadata close to expiry.
//!
//! Each pass selects the latest document of every chain expiring within the
//! configured window and signs its next version, together with whatever the
//! new version forces downstream. Roles are visited root first and timestamp
//! last, so a targets refresh already covers the snapshot and timestamp it
//! pins and those are skipped when their turn comes.

use crate::chain::ChainWriter;
use crate::error::{DirectorError, Result};
use crate::events::{AuditAction, AuditEvent, AuditResource, Event, EventPublisher};
use crate::store::{MetadataKey, StoredMetadata};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info};
use uptane_core::{MetadataError, Role};

const ORDER: [Role; 4] = [Role::Root, Role::Targets, Role::Snapshot, Role::Timestamp];

pub struct Resigner {
    chains: Arc<ChainWriter>,
    events: EventPublisher,
}

impl Resigner {
    pub fn new(chains: Arc<ChainWriter>, events: EventPublisher) -> Self {
        Self { chains, events }
    }

    /// Refresh every document expiring within the window as of `now`.
    ///
    /// Failures are logged and skipped. Returns the number of documents
    /// re-signed, not counting the ones refreshed by a cascade.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let window = self.chains.config().expiry_window.approx_duration();
        let mut resigned = 0;

        for role in ORDER {
            let expiring: Vec<StoredMetadata> = self
                .chains
                .store()
                .latest_per_key(role)
                .await?
                .into_iter()
                .filter(|stored| stored.document.expires_within(now, window))
                .collect();

            for stored in expiring {
                match self.resign(&stored).await {
                    Ok(true) => resigned += 1,
                    Ok(false) => debug!(key = %stored.key, "already refreshed"),
                    Err(e) => error!(key = %stored.key, error = %e, "failed to re-sign metadata"),
                }
            }
        }

        if resigned > 0 {
            info!(resigned, "re-signed expiring metadata");
        }
        Ok(resigned)
    }

    async fn resign(&self, selected: &StoredMetadata) -> Result<bool> {
        let key = &selected.key;
        let _guard = self.chains.lock_cascade(key).await;

        let current = self.latest(key).await?;
        if current.version != selected.version {
            return Ok(false);
        }

        let unit = match key.role {
            Role::Root => self.chains.root_unit(key).await?.0,
            Role::Targets => {
                let targets = current.document.as_targets().ok_or(DirectorError::Metadata(
                    MetadataError::WrongRole {
                        expected: Role::Targets,
                        found: current.document.role(),
                    },
                ))?;
                self.chains
                    .targets_cascade(key, targets.signed.targets.clone(), targets.signed.custom.clone())
                    .await?
            }
            Role::Snapshot => self.chains.snapshot_cascade(key, None).await?,
            Role::Timestamp => self.chains.timestamp_unit(key).await?,
        };

        let documents = unit.len();
        self.chains.store().commit(unit).await?;
        info!(key = %key, version = current.version + 1, documents, "re-signed metadata");

        let meta = json!({
            "repo": key.repo.to_string(),
            "role": key.role.to_string(),
            "robot": key.robot,
            "version": current.version + 1,
        });
        self.events.publish(Event::Audit(
            AuditEvent::service(&key.team, AuditResource::Metadata, AuditAction::Signed).with_meta(meta),
        ));
        Ok(true)
    }

    async fn latest(&self, key: &MetadataKey) -> Result<StoredMetadata> {
        self.chains
            .store()
            .latest(key)
            .await?
            .ok_or_else(|| DirectorError::NotFound(key.to_string()))
    }
}
