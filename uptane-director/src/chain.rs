//! Signing and committing metadata chains.
//!
//! A chain is the root, targets, snapshot and timestamp documents of one
//! repository scope: the team's image repository, or one robot's slice of the
//! director repository (whose root is shared by the team). Every write here
//! reads the latest versions, signs `latest + 1` and commits the affected
//! documents as one [`WriteUnit`], holding the per-key locks of every document
//! it writes.

use crate::config::Config;
use crate::custody::{CustodyError, KeyId, KeyPair, KeyStorage};
use crate::error::{DirectorError, Result};
use crate::store::{next_version, KeyedGuard, KeyedLocks, MetadataKey, MetadataStore, WriteUnit};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uptane_core::metadata::{
    generate_root, generate_snapshot, generate_targets, generate_timestamp, TargetsCustom,
};
use uptane_core::{
    Metadata, MetadataError, PublicKey, Repo, RobotId, Role, RootMetadata, Signer, TargetEntry,
    TargetsMetadata, TeamId,
};

/// Writes metadata chains on behalf of the rest of the service.
pub struct ChainWriter {
    store: Arc<dyn MetadataStore>,
    keys: Arc<dyn KeyStorage>,
    locks: KeyedLocks<MetadataKey>,
    config: Config,
}

impl ChainWriter {
    pub fn new(store: Arc<dyn MetadataStore>, keys: Arc<dyn KeyStorage>, config: Config) -> Self {
        Self {
            store,
            keys,
            locks: KeyedLocks::new(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Lock `key` and every role a change to it cascades into.
    pub async fn lock_cascade(&self, key: &MetadataKey) -> KeyedGuard {
        self.locks.lock_all(cascade_roles(key.role).map(|role| key.sibling(role))).await
    }

    /// Load the online signer of a repository role.
    pub async fn signer(&self, team: &TeamId, repo: Repo, role: Role) -> Result<Signer> {
        let id = KeyId::Repo {
            team: team.clone(),
            repo,
            role,
        };
        Ok(self.keys.get_key_pair(&id).await?.signer()?)
    }

    async fn public_key(&self, team: &TeamId, repo: Repo, role: Role) -> Result<PublicKey> {
        let id = KeyId::Repo {
            team: team.clone(),
            repo,
            role,
        };
        Ok(self.keys.get_key_pair(&id).await?.public()?)
    }

    /// Create the keys and first metadata of a new team.
    ///
    /// Generates one key pair per role per repository, then writes image
    /// root, empty targets, snapshot and timestamp plus director root, all at
    /// version 1.
    pub async fn bootstrap_team(&self, team: &TeamId) -> Result<()> {
        let image_root = MetadataKey::team_scoped(team.clone(), Repo::Image, Role::Root);
        let director_root = MetadataKey::team_scoped(team.clone(), Repo::Director, Role::Root);
        let _guard = self
            .locks
            .lock_all(
                Role::ALL
                    .into_iter()
                    .map(|role| image_root.sibling(role))
                    .chain([director_root.clone()]),
            )
            .await;

        if self.store.latest(&image_root).await?.is_some() {
            return Err(DirectorError::Conflict(format!("Team {} is already bootstrapped", team)));
        }

        let bits = self.config.key_bits;
        let generated = tokio::task::spawn_blocking(move || {
            (0..Repo::ALL.len() * Role::ALL.len())
                .map(|_| Signer::generate_with_bits(bits))
                .collect::<std::result::Result<Vec<_>, _>>()
        })
        .await
        .map_err(|e| CustodyError::Unavailable(format!("key generation aborted: {}", e)))?
        .map_err(MetadataError::from)?;

        let mut signers: BTreeMap<(Repo, Role), Signer> = BTreeMap::new();
        let slots = Repo::ALL
            .into_iter()
            .flat_map(|repo| Role::ALL.into_iter().map(move |role| (repo, role)));
        for (slot, signer) in slots.zip(generated) {
            signers.insert(slot, signer);
        }
        let key = |repo: Repo, role: Role| {
            signers
                .get(&(repo, role))
                .ok_or(DirectorError::NotFound(format!("{} {} key", repo, role)))
        };

        let mut unit = WriteUnit::new();
        for repo in Repo::ALL {
            let root = generate_root(
                self.config.ttl(repo, Role::Root),
                1,
                self.config.consistent_snapshot,
                key(repo, Role::Root)?,
                key(repo, Role::Targets)?.public_key(),
                key(repo, Role::Snapshot)?.public_key(),
                key(repo, Role::Timestamp)?.public_key(),
            )?;
            unit.push(
                MetadataKey::team_scoped(team.clone(), repo, Role::Root),
                Metadata::Root(root),
            );
        }

        let targets = generate_targets(
            self.config.ttl(Repo::Image, Role::Targets),
            1,
            key(Repo::Image, Role::Targets)?,
            BTreeMap::new(),
            None,
        )?;
        let snapshot = generate_snapshot(
            self.config.ttl(Repo::Image, Role::Snapshot),
            1,
            key(Repo::Image, Role::Snapshot)?,
            &targets,
        )?;
        let timestamp = generate_timestamp(
            self.config.ttl(Repo::Image, Role::Timestamp),
            1,
            key(Repo::Image, Role::Timestamp)?,
            &snapshot,
        )?;
        unit.push(image_root.sibling(Role::Targets), Metadata::Targets(targets))
            .push(image_root.sibling(Role::Snapshot), Metadata::Snapshot(snapshot))
            .push(image_root.sibling(Role::Timestamp), Metadata::Timestamp(timestamp));

        let mut stored = Vec::with_capacity(signers.len());
        let written = async {
            for ((repo, role), signer) in &signers {
                let id = KeyId::Repo {
                    team: team.clone(),
                    repo: *repo,
                    role: *role,
                };
                self.keys.put_key_pair(&id, KeyPair::from_signer(signer)?).await?;
                stored.push(id);
            }
            self.store.commit(unit).await?;
            Ok::<_, DirectorError>(())
        }
        .await;

        if let Err(e) = written {
            for id in &stored {
                if let Err(cleanup) = self.keys.delete_key_pair(id).await {
                    warn!(key = %id, error = %cleanup, "failed to discard bootstrap key");
                }
            }
            return Err(e);
        }
        info!(team = %team, "bootstrapped team repositories");
        Ok(())
    }

    /// Add or replace a target in the team's image repository.
    pub async fn publish_image_target(
        &self,
        team: &TeamId,
        target: &str,
        entry: TargetEntry,
    ) -> Result<TargetsMetadata> {
        let key = MetadataKey::team_scoped(team.clone(), Repo::Image, Role::Targets);
        let _guard = self.lock_cascade(&key).await;

        let mut targets = self.current_targets(&key).await?;
        targets.insert(target.to_string(), entry);
        self.commit_targets(&key, targets, None).await
    }

    /// Remove a target from the team's image repository.
    ///
    /// Returns `false` without writing if the target is not listed.
    pub async fn withdraw_image_target(&self, team: &TeamId, target: &str) -> Result<bool> {
        let key = MetadataKey::team_scoped(team.clone(), Repo::Image, Role::Targets);
        let _guard = self.lock_cascade(&key).await;

        let mut targets = self.current_targets(&key).await?;
        if targets.remove(target).is_none() {
            return Ok(false);
        }
        self.commit_targets(&key, targets, None).await?;
        Ok(true)
    }

    /// Replace a robot's director targets and refresh its snapshot and timestamp.
    pub async fn write_director_targets(
        &self,
        team: &TeamId,
        robot: &RobotId,
        targets: BTreeMap<String, TargetEntry>,
        correlation_id: Option<String>,
    ) -> Result<TargetsMetadata> {
        let key = MetadataKey::director(team.clone(), Role::Targets, robot.clone());
        let _guard = self.lock_cascade(&key).await;

        let custom = correlation_id.map(|correlation_id| TargetsCustom { correlation_id });
        self.commit_targets(&key, targets, custom).await
    }

    async fn current_targets(&self, key: &MetadataKey) -> Result<BTreeMap<String, TargetEntry>> {
        let latest = self
            .store
            .latest(key)
            .await?
            .ok_or_else(|| DirectorError::NotFound(key.to_string()))?;
        latest
            .document
            .as_targets()
            .map(|t| t.signed.targets.clone())
            .ok_or(DirectorError::Metadata(MetadataError::WrongRole {
                expected: Role::Targets,
                found: latest.document.role(),
            }))
    }

    async fn commit_targets(
        &self,
        key: &MetadataKey,
        targets: BTreeMap<String, TargetEntry>,
        custom: Option<TargetsCustom>,
    ) -> Result<TargetsMetadata> {
        let unit = self.targets_cascade(key, targets, custom).await?;
        let signed = unit
            .entries()
            .iter()
            .find_map(|(_, doc)| doc.as_targets().cloned())
            .ok_or(DirectorError::Metadata(MetadataError::MissingField("targets")))?;
        self.store.commit(unit).await?;
        debug!(key = %key, version = signed.signed.version, "committed targets cascade");
        Ok(signed)
    }

    /// Sign new targets for `key` plus the snapshot and timestamp pinning
    /// them. Caller holds the cascade locks.
    pub async fn targets_cascade(
        &self,
        key: &MetadataKey,
        targets: BTreeMap<String, TargetEntry>,
        custom: Option<TargetsCustom>,
    ) -> Result<WriteUnit> {
        let version = next_version(self.store.latest(key).await?.as_ref());
        let signer = self.signer(&key.team, key.repo, Role::Targets).await?;
        let doc = generate_targets(self.config.ttl(key.repo, Role::Targets), version, &signer, targets, custom)?;

        let downstream = self.snapshot_cascade(&key.sibling(Role::Snapshot), Some(&doc)).await?;
        let mut unit = WriteUnit::new();
        unit.push(key.clone(), Metadata::Targets(doc)).append(downstream);
        Ok(unit)
    }

    /// Sign a new snapshot for `key` (pinning `targets`, or the latest stored
    /// targets) plus the timestamp pinning it. Caller holds the cascade locks.
    pub async fn snapshot_cascade(
        &self,
        key: &MetadataKey,
        targets: Option<&TargetsMetadata>,
    ) -> Result<WriteUnit> {
        let stored_targets;
        let targets = match targets {
            Some(targets) => targets,
            None => {
                let targets_key = key.sibling(Role::Targets);
                stored_targets = self
                    .store
                    .latest(&targets_key)
                    .await?
                    .ok_or_else(|| DirectorError::NotFound(targets_key.to_string()))?;
                stored_targets
                    .document
                    .as_targets()
                    .ok_or(DirectorError::Metadata(MetadataError::WrongRole {
                        expected: Role::Targets,
                        found: stored_targets.document.role(),
                    }))?
            }
        };

        let version = next_version(self.store.latest(key).await?.as_ref());
        let signer = self.signer(&key.team, key.repo, Role::Snapshot).await?;
        let snapshot = generate_snapshot(self.config.ttl(key.repo, Role::Snapshot), version, &signer, targets)?;

        let timestamp_key = key.sibling(Role::Timestamp);
        let version = next_version(self.store.latest(&timestamp_key).await?.as_ref());
        let signer = self.signer(&key.team, key.repo, Role::Timestamp).await?;
        let timestamp = generate_timestamp(self.config.ttl(key.repo, Role::Timestamp), version, &signer, &snapshot)?;

        let mut unit = WriteUnit::new();
        unit.push(key.clone(), Metadata::Snapshot(snapshot))
            .push(timestamp_key, Metadata::Timestamp(timestamp));
        Ok(unit)
    }

    /// Sign a new timestamp for `key` pinning the latest stored snapshot.
    /// Caller holds the lock.
    pub async fn timestamp_unit(&self, key: &MetadataKey) -> Result<WriteUnit> {
        let snapshot_key = key.sibling(Role::Snapshot);
        let stored = self
            .store
            .latest(&snapshot_key)
            .await?
            .ok_or_else(|| DirectorError::NotFound(snapshot_key.to_string()))?;
        let snapshot = stored.document.as_snapshot().ok_or(DirectorError::Metadata(
            MetadataError::WrongRole {
                expected: Role::Snapshot,
                found: stored.document.role(),
            },
        ))?;

        let version = next_version(self.store.latest(key).await?.as_ref());
        let signer = self.signer(&key.team, key.repo, Role::Timestamp).await?;
        let timestamp = generate_timestamp(self.config.ttl(key.repo, Role::Timestamp), version, &signer, snapshot)?;

        let mut unit = WriteUnit::new();
        unit.push(key.clone(), Metadata::Timestamp(timestamp));
        Ok(unit)
    }

    /// Sign the next root version of a repository. Caller holds the lock.
    pub async fn root_unit(&self, key: &MetadataKey) -> Result<(WriteUnit, RootMetadata)> {
        let (team, repo) = (&key.team, key.repo);
        let version = next_version(self.store.latest(key).await?.as_ref());
        let root = generate_root(
            self.config.ttl(repo, Role::Root),
            version,
            self.config.consistent_snapshot,
            &self.signer(team, repo, Role::Root).await?,
            &self.public_key(team, repo, Role::Targets).await?,
            &self.public_key(team, repo, Role::Snapshot).await?,
            &self.public_key(team, repo, Role::Timestamp).await?,
        )?;

        let mut unit = WriteUnit::new();
        unit.push(key.clone(), Metadata::Root(root.clone()));
        Ok((unit, root))
    }
}

/// `role` followed by the roles a new version of it forces.
pub fn cascade_roles(role: Role) -> impl Iterator<Item = Role> {
    let downstream: &'static [Role] = match role {
        Role::Root => &[Role::Root],
        Role::Targets => &[Role::Targets, Role::Snapshot, Role::Timestamp],
        Role::Snapshot => &[Role::Snapshot, Role::Timestamp],
        Role::Timestamp => &[Role::Timestamp],
    };
    downstream.iter().copied()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::custody::test_support::signer;
    use crate::custody::InMemoryKeyStorage;
    use crate::store::InMemoryMetadataStore;

    /// Store the cached test keys as the repository keys of `team`.
    pub async fn seed_keys(keys: &dyn KeyStorage, team: &TeamId) {
        let mut index = 0;
        for repo in Repo::ALL {
            for role in Role::ALL {
                let id = KeyId::Repo {
                    team: team.clone(),
                    repo,
                    role,
                };
                keys.put_key_pair(&id, KeyPair::from_signer(signer(index)).unwrap())
                    .await
                    .unwrap();
                index += 1;
            }
        }
    }

    /// A writer over empty in-memory stores holding the keys of `team`.
    pub async fn writer(team: &TeamId) -> ChainWriter {
        let keys = Arc::new(InMemoryKeyStorage::new());
        seed_keys(keys.as_ref(), team).await;
        ChainWriter::new(Arc::new(InMemoryMetadataStore::new()), keys, Config::default())
    }
}
