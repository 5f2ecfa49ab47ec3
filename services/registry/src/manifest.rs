//! Manifest lookups for the read path

use serde::Deserialize;

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::storage::{ManifestRecord, RegistryStorage};

/// A manifest body ready to serve.
#[derive(Debug, Clone)]
pub struct ManifestBody {
    /// The canonical name the body was read from.
    pub name: String,

    /// The declared media type.
    pub media_type: String,

    /// Content digest of the body.
    pub digest: Digest,

    /// The raw body.
    pub body: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct Declared {
    #[serde(rename = "mediaType")]
    media_type: String,
}

/// Resolves manifest names through the index and reads their bodies.
///
/// Only names the lifecycle handler has indexed are visible.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    storage: RegistryStorage,
}

impl ManifestStore {
    /// Create a manifest store.
    pub fn new(storage: RegistryStorage) -> Self {
        Self { storage }
    }

    async fn live(&self, name: &str) -> RegistryResult<ManifestRecord> {
        let record: Option<ManifestRecord> =
            self.storage.manifests().get(&ManifestRecord::key(name)).await?;
        match record {
            Some(record) if !record.is_tombstone() => Ok(record),
            _ => Err(RegistryError::ManifestNotFound(name.to_string())),
        }
    }

    /// The canonical name `name` resolves to, following digest aliases.
    #[tracing::instrument(skip(self))]
    pub async fn resolve(&self, name: &str) -> RegistryResult<String> {
        let record = self.live(name).await?;
        match record.actual {
            Some(actual) => {
                self.live(&actual).await?;
                tracing::trace!(%actual, "resolved alias");
                Ok(actual)
            }
            None => Ok(record.name),
        }
    }

    /// Resolve `name` and read the current body.
    #[tracing::instrument(skip(self))]
    pub async fn get(&self, name: &str) -> RegistryResult<ManifestBody> {
        let canonical = self.resolve(name).await?;
        let path = self.storage.manifest_path(&canonical);
        let body = self
            .storage
            .read_object(&path, None)
            .await
            .map_err(|err| match err {
                RegistryError::Storage(err) if err.is_not_found() => {
                    RegistryError::ManifestNotFound(name.to_string())
                }
                other => other,
            })?;

        let declared: Declared =
            serde_json::from_slice(&body).map_err(|err| RegistryError::InvalidManifest {
                name: canonical.clone(),
                reason: err.to_string(),
            })?;

        Ok(ManifestBody {
            name: canonical,
            media_type: declared.media_type,
            digest: Digest::sha256(&body),
            body,
        })
    }
}
