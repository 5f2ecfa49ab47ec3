//! The manifest lifecycle: indexing on creation, collection and tombstoning
//! on deletion.
//!
//! Notifications arrive at least once and possibly out of order, so every
//! transition here can be re-run from scratch. Nothing is locked; the only
//! coordination between handlers is the conditional tombstone write.

use std::fmt;

use camino::Utf8Path;
use chrono::Utc;
use storage::{Condition, ObjectEvent, ObjectEventKind, VersionId};

use crate::blob::BlobStore;
use crate::config::ConflictPolicy;
use crate::digest::{Digest, ManifestName};
use crate::error::{RegistryError, RegistryResult};
use crate::gc::{GarbageCollector, GcReport};
use crate::indexer::ReferenceIndexer;
use crate::storage::{ManifestRecord, RegistryStorage};

/// The state of a manifest name in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestState {
    /// No record.
    Absent,

    /// Indexed and live.
    Active,

    /// Deleted; the record lapses when its tombstone expires.
    Tombstoned,
}

impl fmt::Display for ManifestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestState::Absent => f.write_str("absent"),
            ManifestState::Active => f.write_str("active"),
            ManifestState::Tombstoned => f.write_str("tombstoned"),
        }
    }
}

/// What handling one event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The event was not for a manifest in this registry.
    Ignored,

    /// The manifest was indexed.
    Indexed {
        /// Content digest of the manifest body.
        digest: Digest,
        /// Digests the manifest references.
        references: Vec<Digest>,
    },

    /// The version named by a creation no longer exists, or its object has
    /// been deleted since.
    Vanished,

    /// A deletion arrived after the object was written again.
    Stale {
        /// The object's current version.
        current: VersionId,
    },

    /// The manifest was tombstoned, after collecting its edges if it was
    /// active.
    Tombstoned {
        /// What collection removed, if it ran.
        report: Option<GcReport>,
    },

    /// A deletion lost a race to a creation of the same name, and the
    /// manifest was indexed again as it is now.
    Superseded {
        /// Content digest of the current manifest body.
        digest: Digest,
    },
}

/// Drives indexing and garbage collection from object store notifications.
#[derive(Debug, Clone)]
pub struct ManifestLifecycleHandler {
    storage: RegistryStorage,
    indexer: ReferenceIndexer,
    gc: GarbageCollector,
}

impl ManifestLifecycleHandler {
    /// Create a handler over the registry's storage.
    pub fn new(storage: RegistryStorage) -> Self {
        let blobs = BlobStore::new(storage.clone());
        Self {
            indexer: ReferenceIndexer::new(storage.clone(), blobs.clone()),
            gc: GarbageCollector::new(storage.clone(), blobs),
            storage,
        }
    }

    /// Handle one notification.
    ///
    /// Events for other buckets, or for keys outside the manifest prefix,
    /// are ignored. Transient storage errors retry the whole transition,
    /// and the whole attempt runs under the configured time budget.
    #[tracing::instrument(skip_all, fields(kind = %event.kind, key = %event.key, version = %event.version))]
    pub async fn handle(&self, event: &ObjectEvent) -> RegistryResult<Outcome> {
        let config = self.storage.config();
        if event.bucket != config.bucket {
            tracing::debug!(bucket = %event.bucket, "ignoring event for another bucket");
            return Ok(Outcome::Ignored);
        }

        let Some(name) = self.storage.manifest_name(&event.key) else {
            tracing::trace!("ignoring key outside the manifest prefix");
            return Ok(Outcome::Ignored);
        };

        let name: ManifestName = match name.parse() {
            Ok(name) => name,
            Err(err) => {
                tracing::warn!("ignoring manifest event: {err}");
                return Ok(Outcome::Ignored);
            }
        };

        let budget = config.event_timeout();
        let name = &name;
        let transition = config.retry.retry(move || async move {
            match event.kind {
                ObjectEventKind::Created => self.on_created(name, Some(&event.version)).await,
                ObjectEventKind::Removed => self.on_deleted(name, &event.version).await,
            }
        });

        tokio::time::timeout(budget, transition)
            .await
            .map_err(|_| RegistryError::Timeout(budget))?
    }

    /// Index a manifest version and mark the name active.
    ///
    /// Without a version, indexes whatever version is current. A version
    /// whose object has since been deleted is not indexed, and if the
    /// deletion lands while indexing is under way the name is collected
    /// again before returning.
    #[tracing::instrument(skip(self), fields(%name))]
    pub async fn on_created(
        &self,
        name: &ManifestName,
        version: Option<&VersionId>,
    ) -> RegistryResult<Outcome> {
        let canonical = name.to_string();
        let path = self.storage.manifest_path(&canonical);

        let version = match version {
            Some(version) => version.clone(),
            None => match self.current_version(&path).await? {
                Some(version) => version,
                None => {
                    tracing::warn!("manifest has no current version");
                    return Ok(Outcome::Vanished);
                }
            },
        };

        let body = match self.storage.read_object(&path, Some(&version)).await {
            Ok(body) => body,
            Err(RegistryError::Storage(err)) if err.is_not_found() => {
                tracing::warn!(%version, "manifest version no longer exists");
                return Ok(Outcome::Vanished);
            }
            Err(err) => return Err(err),
        };

        if self.current_version(&path).await?.is_none() {
            tracing::warn!(%version, "manifest was deleted after this version was written");
            return Ok(Outcome::Vanished);
        }

        let digest = Digest::sha256(&body);
        let references = self.indexer.index(&body, name).await?;

        self.storage
            .manifests()
            .put(
                &ManifestRecord::key(&canonical),
                &ManifestRecord::active(&canonical),
                Condition::Always,
            )
            .await?;

        if !name.is_digest() {
            let alias = name.alias(digest.clone()).to_string();
            self.storage
                .manifests()
                .put(
                    &ManifestRecord::key(&alias),
                    &ManifestRecord::alias(&alias, &canonical),
                    Condition::Always,
                )
                .await?;
        }

        // A deletion handled between the check above and the record write
        // would otherwise be overwritten.
        if self.current_version(&path).await?.is_none() {
            tracing::warn!(%version, "manifest was deleted while being indexed, collecting it again");
            self.retire(&canonical).await?;
            return Ok(Outcome::Vanished);
        }

        self.storage
            .audit(&path, &version, "indexed", Utc::now().timestamp())
            .await;
        tracing::info!(%digest, references = references.len(), "manifest active");
        Ok(Outcome::Indexed { digest, references })
    }

    /// Collect a deleted manifest's edges and tombstone its name.
    ///
    /// `marker` is the delete marker version. A deletion is stale, and
    /// changes nothing, when the object has a current version again.
    #[tracing::instrument(skip(self), fields(%name))]
    pub async fn on_deleted(&self, name: &ManifestName, marker: &VersionId) -> RegistryResult<Outcome> {
        let canonical = name.to_string();
        let path = self.storage.manifest_path(&canonical);

        if let Some(current) = self.current_version(&path).await? {
            tracing::info!(%current, "manifest exists again, ignoring stale deletion");
            return Ok(Outcome::Stale { current });
        }

        let record: Option<ManifestRecord> = self
            .storage
            .manifests()
            .get(&ManifestRecord::key(&canonical))
            .await?;

        let report = match &record {
            Some(record) if !record.is_tombstone() => Some(self.gc.collect_all(&canonical).await?),
            _ => None,
        };

        match self.install_tombstone(&canonical, record.is_some()).await {
            Ok(()) => {}
            Err(RegistryError::ConcurrentModification(_))
                if self.storage.config().on_conflict == ConflictPolicy::Reindex =>
            {
                tracing::warn!("manifest was created while being deleted, indexing it again");
                return match self.on_created(name, None).await? {
                    Outcome::Indexed { digest, .. } => Ok(Outcome::Superseded { digest }),
                    _ => Err(RegistryError::ConcurrentModification(canonical)),
                };
            }
            Err(err) => return Err(err),
        }

        if self.current_version(&path).await?.is_some() {
            tracing::warn!("manifest was pushed again while being deleted, indexing it again");
            if let Outcome::Indexed { digest, .. } = self.on_created(name, None).await? {
                return Ok(Outcome::Superseded { digest });
            }
        }

        self.storage
            .audit(&path, marker, "deindexed", Utc::now().timestamp())
            .await;
        tracing::info!(collected = report.is_some(), "manifest tombstoned");
        Ok(Outcome::Tombstoned { report })
    }

    /// Collect a name whose object is gone and tombstone it over whatever
    /// record is there.
    async fn retire(&self, name: &str) -> RegistryResult<GcReport> {
        let report = self.gc.collect_all(name).await?;
        self.install_tombstone(name, true).await?;
        Ok(report)
    }

    /// The current version of a manifest object, or `None` if it was never
    /// written or its latest version is a delete marker.
    async fn current_version(&self, path: &Utf8Path) -> RegistryResult<Option<VersionId>> {
        match self.storage.objects().metadata(path).await {
            Ok(meta) => Ok(Some(meta.version)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Write a tombstone for `name`.
    ///
    /// Unless the caller `observed` a record under this name during the
    /// same transition, the write only succeeds if no record exists. A
    /// failed precondition is reported as `ConcurrentModification`.
    #[tracing::instrument(skip(self))]
    pub async fn install_tombstone(&self, name: &str, observed: bool) -> RegistryResult<()> {
        let ttl = i64::try_from(self.storage.config().tombstone_ttl_secs).unwrap_or(i64::MAX);
        let expires = Utc::now().timestamp().saturating_add(ttl);
        let condition = if observed {
            Condition::Always
        } else {
            Condition::KeyAbsent
        };

        self.storage
            .manifests()
            .put(
                &ManifestRecord::key(name),
                &ManifestRecord::tombstone(name, expires),
                condition,
            )
            .await
            .map_err(|err| {
                if err.is_condition_failed() {
                    RegistryError::ConcurrentModification(name.to_string())
                } else {
                    err.into()
                }
            })?;

        tracing::debug!(expires, "installed tombstone");
        Ok(())
    }

    /// The current state of a manifest name.
    pub async fn state(&self, name: &str) -> RegistryResult<ManifestState> {
        let record: Option<ManifestRecord> =
            self.storage.manifests().get(&ManifestRecord::key(name)).await?;
        Ok(match record {
            None => ManifestState::Absent,
            Some(record) if record.is_tombstone() => ManifestState::Tombstoned,
            Some(_) => ManifestState::Active,
        })
    }

    /// The storage this handler works against.
    pub fn storage(&self) -> &RegistryStorage {
        &self.storage
    }
}
