//! Storage layer for the registry: object paths, index tables and row types

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use storage::{Index, IndexTable, Key, Storage, StorageBucket, Tag, VersionId};

use crate::config::RegistryConfig;
use crate::digest::Digest;
use crate::error::RegistryResult;

/// A row in the manifests table.
///
/// An active record has neither field set. An alias sets `actual` to the
/// canonical tag-addressed name and never points at content itself. A
/// tombstone sets `expires`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    /// The manifest name.
    pub name: String,

    /// For digest-addressed aliases, the canonical name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,

    /// For tombstones, unix seconds after which the record lapses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
}

impl ManifestRecord {
    /// A live manifest.
    pub fn active(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actual: None,
            expires: None,
        }
    }

    /// A digest-addressed alias of `actual`.
    pub fn alias(name: impl Into<String>, actual: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actual: Some(actual.into()),
            expires: None,
        }
    }

    /// A deleted manifest, remembered until `expires`.
    pub fn tombstone(name: impl Into<String>, expires: i64) -> Self {
        Self {
            name: name.into(),
            actual: None,
            expires: Some(expires),
        }
    }

    /// Whether this record marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.expires.is_some()
    }

    /// The row key.
    pub fn key(name: &str) -> Key {
        Key::new(name)
    }
}

/// A forward edge: manifest `source` depends on `digest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEdge {
    /// The referencing manifest name.
    pub source: String,

    /// The referenced blob.
    pub digest: Digest,

    /// Whether the blob existed when the edge was written.
    pub found: bool,
}

impl ReferenceEdge {
    /// The row key.
    pub fn key(source: &str, digest: &Digest) -> Key {
        Key::with_sort(source, digest.as_str())
    }
}

/// A reverse edge: `digest` is referenced by manifest `source`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseReferenceEdge {
    /// The referenced blob.
    pub digest: Digest,

    /// The referencing manifest name.
    pub source: String,
}

impl ReverseReferenceEdge {
    /// The row key.
    pub fn key(digest: &Digest, source: &str) -> Key {
        Key::with_sort(digest.as_str(), source)
    }
}

/// A cached observation that a blob exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistenceRecord {
    /// The blob digest.
    pub digest: Digest,
}

impl ExistenceRecord {
    /// The row key.
    pub fn key(digest: &Digest) -> Key {
        Key::new(digest.as_str())
    }
}

/// Handles on every piece of shared state the registry touches.
///
/// Cheap to clone; every component holds its own copy.
#[derive(Debug, Clone)]
pub struct RegistryStorage {
    objects: StorageBucket,
    manifests: IndexTable,
    references: IndexTable,
    in_references: IndexTable,
    blobs: IndexTable,
    config: Arc<RegistryConfig>,
}

impl RegistryStorage {
    /// Bind the object store and index store to the configured bucket and
    /// tables.
    pub fn new(storage: &Storage, index: &Index, config: RegistryConfig) -> Self {
        Self {
            objects: storage.bucket(config.bucket.clone()),
            manifests: index.table(config.tables.manifests.clone()),
            references: index.table(config.tables.references.clone()),
            in_references: index.table(config.tables.in_references.clone()),
            blobs: index.table(config.tables.blobs.clone()),
            config: Arc::new(config),
        }
    }

    /// The configuration in effect.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// The object store bucket.
    pub fn objects(&self) -> &StorageBucket {
        &self.objects
    }

    /// The manifests table.
    pub fn manifests(&self) -> &IndexTable {
        &self.manifests
    }

    /// The forward edge table.
    pub fn references(&self) -> &IndexTable {
        &self.references
    }

    /// The reverse edge table.
    pub fn in_references(&self) -> &IndexTable {
        &self.in_references
    }

    /// The existence cache table.
    pub fn blobs(&self) -> &IndexTable {
        &self.blobs
    }

    /// Object key of a blob: `blobs/<digest>`.
    pub fn blob_path(&self, digest: &Digest) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}{}", self.config.blob_prefix, digest))
    }

    /// Object key of a manifest: `manifests/<name>`.
    pub fn manifest_path(&self, name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}{}", self.config.manifest_prefix, name))
    }

    /// The manifest name of an object key, if it lies under the manifest
    /// prefix.
    pub fn manifest_name<'k>(&self, key: &'k str) -> Option<&'k str> {
        key.strip_prefix(self.config.manifest_prefix.as_str())
            .filter(|name| !name.is_empty())
    }

    /// Read a whole object, the current version unless `version` is given.
    pub async fn read_object(
        &self,
        path: &Utf8Path,
        version: Option<&VersionId>,
    ) -> RegistryResult<Vec<u8>> {
        let mut data = Vec::new();
        self.objects.download(path, version, &mut data).await?;
        Ok(data)
    }

    /// Tag an object version for diagnostics. Failures are logged, never
    /// returned.
    pub async fn audit(&self, path: &Utf8Path, version: &VersionId, key: &str, at: i64) {
        let tags = [Tag::new(key, at.to_string())];
        if let Err(err) = self.objects.tag(path, version, &tags).await {
            tracing::warn!(%path, %version, "failed to tag object {key}: {err}");
        }
    }
}
