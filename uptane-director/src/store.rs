//! Versioned metadata storage.
//!
//! Documents are immutable and keyed by `(team, repo, role, robot?)`. For each
//! key the stored versions form a gap-free sequence starting at 1. Writers
//! serialize "read latest, write latest + 1" through [`KeyedLocks`], and the
//! store re-checks the sequence when a [`WriteUnit`] is committed so a writer
//! that skipped the lock still cannot fork a chain.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use uptane_core::{Metadata, Repo, RobotId, Role, TeamId};

/// Identity of a metadata chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetadataKey {
    pub team: TeamId,
    pub repo: Repo,
    pub role: Role,
    /// Set for director targets, snapshot and timestamp
    pub robot: Option<RobotId>,
}

impl MetadataKey {
    pub fn team_scoped(team: TeamId, repo: Repo, role: Role) -> Self {
        Self {
            team,
            repo,
            role,
            robot: None,
        }
    }

    /// Key of a director role. Root stays team-scoped.
    pub fn director(team: TeamId, role: Role, robot: RobotId) -> Self {
        let robot = (role != Role::Root).then_some(robot);
        Self {
            team,
            repo: Repo::Director,
            role,
            robot,
        }
    }

    /// Same team, repo and robot scope, different role.
    pub fn sibling(&self, role: Role) -> Self {
        Self {
            team: self.team.clone(),
            repo: self.repo,
            role,
            robot: if role == Role::Root { None } else { self.robot.clone() },
        }
    }
}

impl fmt::Display for MetadataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.robot {
            Some(robot) => write!(f, "{}/{}/{}/{}", self.team, self.repo, robot, self.role),
            None => write!(f, "{}/{}/{}", self.team, self.repo, self.role),
        }
    }
}

/// A committed document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMetadata {
    pub key: MetadataKey,
    pub version: u64,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub document: Metadata,
}

/// Documents committed together or not at all.
#[derive(Debug, Clone, Default)]
pub struct WriteUnit {
    entries: Vec<(MetadataKey, Metadata)>,
}

impl WriteUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: MetadataKey, document: Metadata) -> &mut Self {
        self.entries.push((key, document));
        self
    }

    /// Move every document of `other` to the end of this unit.
    pub fn append(&mut self, other: WriteUnit) -> &mut Self {
        self.entries.extend(other.entries);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[(MetadataKey, Metadata)] {
        &self.entries
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Version conflict on {key}: expected {expected}, got {found}")]
    VersionConflict {
        key: MetadataKey,
        expected: u64,
        found: u64,
    },

    #[error("{key} cannot hold {found} metadata")]
    RoleMismatch { key: MetadataKey, found: Role },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence for metadata chains.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert every document of `unit` atomically.
    ///
    /// Each document must be exactly one version past the latest stored (or
    /// earlier in the same unit) for its key.
    async fn commit(&self, unit: WriteUnit) -> Result<()>;

    async fn latest(&self, key: &MetadataKey) -> Result<Option<StoredMetadata>>;

    async fn by_version(&self, key: &MetadataKey, version: u64) -> Result<Option<StoredMetadata>>;

    /// Latest document of every key holding `role`.
    async fn latest_per_key(&self, role: Role) -> Result<Vec<StoredMetadata>>;
}

/// Version that `latest` would be succeeded by.
pub fn next_version(latest: Option<&StoredMetadata>) -> u64 {
    latest.map(|m| m.version).unwrap_or(0) + 1
}

/// Metadata store held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    chains: RwLock<BTreeMap<MetadataKey, Vec<StoredMetadata>>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn commit(&self, unit: WriteUnit) -> Result<()> {
        let mut chains = self.chains.write().await;

        // validate the whole unit before touching any chain
        let mut heads: HashMap<&MetadataKey, u64> = HashMap::new();
        for (key, document) in &unit.entries {
            if document.role() != key.role {
                return Err(StoreError::RoleMismatch {
                    key: key.clone(),
                    found: document.role(),
                });
            }
            let head = match heads.get(key) {
                Some(version) => *version,
                None => chains
                    .get(key)
                    .and_then(|chain| chain.last())
                    .map(|m| m.version)
                    .unwrap_or(0),
            };
            if document.version() != head + 1 {
                return Err(StoreError::VersionConflict {
                    key: key.clone(),
                    expected: head + 1,
                    found: document.version(),
                });
            }
            heads.insert(key, document.version());
        }

        let now = Utc::now();
        for (key, document) in unit.entries {
            let stored = StoredMetadata {
                key: key.clone(),
                version: document.version(),
                expires_at: document.expires(),
                created_at: now,
                document,
            };
            chains.entry(key).or_default().push(stored);
        }
        Ok(())
    }

    async fn latest(&self, key: &MetadataKey) -> Result<Option<StoredMetadata>> {
        Ok(self
            .chains
            .read()
            .await
            .get(key)
            .and_then(|chain| chain.last())
            .cloned())
    }

    async fn by_version(&self, key: &MetadataKey, version: u64) -> Result<Option<StoredMetadata>> {
        // versions are gap-free from 1, so the version is the position
        let index = match usize::try_from(version) {
            Ok(v) if v >= 1 => v - 1,
            _ => return Ok(None),
        };
        Ok(self
            .chains
            .read()
            .await
            .get(key)
            .and_then(|chain| chain.get(index))
            .cloned())
    }

    async fn latest_per_key(&self, role: Role) -> Result<Vec<StoredMetadata>> {
        Ok(self
            .chains
            .read()
            .await
            .iter()
            .filter(|(key, _)| key.role == role)
            .filter_map(|(_, chain)| chain.last().cloned())
            .collect())
    }
}

/// Per-key async mutexes.
///
/// Multi-key acquisitions take their keys in sorted order so two writers
/// locking overlapping key sets cannot deadlock.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

/// Guards held for a set of keys; released on drop.
#[derive(Debug)]
pub struct KeyedGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl<K: Ord + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock(&self, key: K) -> KeyedGuard {
        self.lock_all([key]).await
    }

    pub async fn lock_all(&self, keys: impl IntoIterator<Item = K>) -> KeyedGuard {
        let mut keys: Vec<K> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mutexes: Vec<Arc<AsyncMutex<()>>> = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // drop mutexes nobody holds or waits on
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            keys.into_iter()
                .map(|k| locks.entry(k).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(mutexes.len());
        for mutex in mutexes {
            guards.push(mutex.lock_owned().await);
        }
        KeyedGuard { _guards: guards }
    }
}

impl<K: Ord + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custody::test_support::signer;
    use std::collections::BTreeMap as Map;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uptane_core::metadata::generate_targets;
    use uptane_core::Ttl;

    fn key(robot: &str) -> MetadataKey {
        MetadataKey::director(TeamId("team-1".into()), Role::Targets, RobotId(robot.into()))
    }

    fn targets(version: u64) -> Metadata {
        Metadata::Targets(generate_targets(Ttl::days(1), version, signer(0), Map::new(), None).unwrap())
    }

    #[tokio::test]
    async fn test_commit_requires_gap_free_versions() {
        let store = InMemoryMetadataStore::new();

        let mut unit = WriteUnit::new();
        unit.push(key("R-1"), targets(2));
        assert!(matches!(
            store.commit(unit).await,
            Err(StoreError::VersionConflict { expected: 1, found: 2, .. })
        ));

        let mut unit = WriteUnit::new();
        unit.push(key("R-1"), targets(1)).push(key("R-1"), targets(2));
        store.commit(unit).await.unwrap();

        let mut unit = WriteUnit::new();
        unit.push(key("R-1"), targets(2));
        assert!(store.commit(unit).await.is_err());

        assert_eq!(store.latest(&key("R-1")).await.unwrap().unwrap().version, 2);
        assert_eq!(store.by_version(&key("R-1"), 1).await.unwrap().unwrap().version, 1);
        assert!(store.by_version(&key("R-1"), 0).await.unwrap().is_none());
        assert!(store.by_version(&key("R-1"), 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_unit_writes_nothing() {
        let store = InMemoryMetadataStore::new();

        let mut unit = WriteUnit::new();
        unit.push(key("R-1"), targets(1)).push(key("R-2"), targets(5));
        assert!(store.commit(unit).await.is_err());
        assert!(store.latest(&key("R-1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_role_mismatch_rejected() {
        let store = InMemoryMetadataStore::new();
        let mut unit = WriteUnit::new();
        unit.push(key("R-1").sibling(Role::Snapshot), targets(1));
        assert!(matches!(
            store.commit(unit).await,
            Err(StoreError::RoleMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_latest_per_key() {
        let store = InMemoryMetadataStore::new();
        let mut unit = WriteUnit::new();
        unit.push(key("R-1"), targets(1))
            .push(key("R-1"), targets(2))
            .push(key("R-2"), targets(1));
        store.commit(unit).await.unwrap();

        let mut latest = store.latest_per_key(Role::Targets).await.unwrap();
        latest.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].version, 2);
        assert_eq!(latest[1].version, 1);
        assert!(store.latest_per_key(Role::Snapshot).await.unwrap().is_empty());
    }

    #[test]
    fn test_director_root_is_team_scoped() {
        let root = MetadataKey::director(TeamId("t".into()), Role::Root, RobotId("R".into()));
        assert!(root.robot.is_none());
        assert_eq!(key("R").sibling(Role::Timestamp).robot, Some(RobotId("R".into())));
        assert_eq!(key("R").to_string(), "team-1/director/R/targets");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_keyed_locks_serialize_same_key() {
        let locks = Arc::new(KeyedLocks::<String>::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let (locks, inside, max_inside) = (locks.clone(), inside.clone(), max_inside.clone());
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock_all(["b".to_string(), "a".to_string()]).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
