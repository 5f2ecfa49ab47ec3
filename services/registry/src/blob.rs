//! Content-addressed blobs and the durable existence cache in front of them

use std::collections::HashSet;

use futures::future::try_join_all;
use storage::{Condition, StorageErrorKind};

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::storage::{ExistenceRecord, RegistryStorage};

/// Blob storage keyed by digest.
///
/// Existence facts are cached forever once observed: content at a digest
/// never changes, and a deleted digest is never resurrected.
#[derive(Debug, Clone)]
pub struct BlobStore {
    storage: RegistryStorage,
}

impl BlobStore {
    /// Create a blob store over the registry's storage.
    pub fn new(storage: RegistryStorage) -> Self {
        Self { storage }
    }

    /// The subset of `digests` which exist.
    ///
    /// Checks the cache in batches, then asks the object store about
    /// anything the cache did not know about and records what it finds.
    #[tracing::instrument(skip_all, fields(digests = digests.len()))]
    pub async fn exists(&self, digests: &[Digest]) -> RegistryResult<HashSet<Digest>> {
        let mut found = HashSet::with_capacity(digests.len());

        for chunk in digests.chunks(self.storage.config().batch_size()) {
            let keys: Vec<_> = chunk.iter().map(ExistenceRecord::key).collect();
            let cached: Vec<ExistenceRecord> = self.storage.blobs().batch_get(&keys).await?;
            found.extend(cached.into_iter().map(|record| record.digest));
        }
        tracing::trace!(cached = found.len(), "existence cache hits");

        let misses: Vec<&Digest> = digests
            .iter()
            .filter(|digest| !found.contains(*digest))
            .collect();

        let checked = try_join_all(misses.into_iter().map(|digest| self.check(digest))).await?;
        found.extend(checked.into_iter().flatten());

        Ok(found)
    }

    /// Check the object store directly, caching a positive answer.
    async fn check(&self, digest: &Digest) -> RegistryResult<Option<Digest>> {
        match self.storage.objects().metadata(&self.storage.blob_path(digest)).await {
            Ok(_) => {
                let record = ExistenceRecord {
                    digest: digest.clone(),
                };
                self.storage
                    .blobs()
                    .put(&ExistenceRecord::key(digest), &record, Condition::Always)
                    .await?;
                tracing::debug!(%digest, "cached blob existence");
                Ok(Some(digest.clone()))
            }
            Err(err) if err.kind() == StorageErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete blob content, then its existence record.
    ///
    /// The caller must already have observed that nothing references the
    /// digest.
    #[tracing::instrument(skip(self), fields(%digest))]
    pub async fn delete(&self, digest: &Digest) -> RegistryResult<()> {
        match self.storage.objects().delete(&self.storage.blob_path(digest)).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                tracing::debug!("blob content already gone");
            }
            Err(err) => return Err(err.into()),
        }
        self.storage
            .blobs()
            .delete(&ExistenceRecord::key(digest))
            .await?;
        tracing::info!("deleted blob");
        Ok(())
    }

    /// Read a blob's bytes.
    #[tracing::instrument(skip(self), fields(%digest))]
    pub async fn get(&self, digest: &Digest) -> RegistryResult<Vec<u8>> {
        self.storage
            .read_object(&self.storage.blob_path(digest), None)
            .await
            .map_err(|err| match err {
                RegistryError::Storage(err) if err.is_not_found() => {
                    RegistryError::BlobNotFound(digest.to_string())
                }
                other => other,
            })
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;
    use storage::{Index, MemoryStorage, Storage};

    use super::*;
    use crate::config::RegistryConfig;

    async fn setup() -> (Storage, Index, BlobStore) {
        let config = RegistryConfig::default();
        let storage: Storage = MemoryStorage::with_buckets(&[&config.bucket]).into();
        let index = storage::IndexConfig::Memory
            .build(&config.tables.specs())
            .await
            .unwrap();
        let registry = RegistryStorage::new(&storage, &index, config);
        (storage, index, BlobStore::new(registry))
    }

    async fn upload(storage: &Storage, digest: &str, data: &[u8]) {
        let mut reader = data;
        storage
            .bucket("registry")
            .upload(Utf8Path::new(&format!("blobs/{digest}")), &mut reader)
            .await
            .unwrap();
    }

    fn digest(s: &str) -> Digest {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn checks_storage_then_caches_present_blobs() {
        let (storage, index, blobs) = setup().await;
        upload(&storage, "sha256:aaa", b"layer").await;

        let found = blobs
            .exists(&[digest("sha256:aaa"), digest("sha256:ccc")])
            .await
            .unwrap();
        assert_eq!(found, HashSet::from([digest("sha256:aaa")]));

        let cached: Option<ExistenceRecord> = index
            .table("registry_blobs")
            .get(&ExistenceRecord::key(&digest("sha256:aaa")))
            .await
            .unwrap();
        assert!(cached.is_some());

        let missing: Option<ExistenceRecord> = index
            .table("registry_blobs")
            .get(&ExistenceRecord::key(&digest("sha256:ccc")))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn cache_hits_skip_the_object_store() {
        let (_storage, index, blobs) = setup().await;
        let aaa = digest("sha256:aaa");
        index
            .table("registry_blobs")
            .put(
                &ExistenceRecord::key(&aaa),
                &ExistenceRecord { digest: aaa.clone() },
                Condition::Always,
            )
            .await
            .unwrap();

        let found = blobs.exists(std::slice::from_ref(&aaa)).await.unwrap();
        assert!(found.contains(&aaa));
    }

    #[tokio::test]
    async fn batches_larger_than_one_round_trip() {
        let (storage, _index, blobs) = setup().await;
        let digests: Vec<Digest> = (0..250).map(|n| digest(&format!("sha256:{n:04x}"))).collect();
        for d in digests.iter().step_by(50) {
            upload(&storage, d.as_str(), b"x").await;
        }

        let found = blobs.exists(&digests).await.unwrap();
        assert_eq!(found.len(), 5);

        // Second pass is answered from the cache.
        let found = blobs.exists(&digests).await.unwrap();
        assert_eq!(found.len(), 5);
    }

    #[tokio::test]
    async fn delete_removes_content_and_cache_record() {
        let (storage, index, blobs) = setup().await;
        let aaa = digest("sha256:aaa");
        upload(&storage, aaa.as_str(), b"layer").await;
        blobs.exists(std::slice::from_ref(&aaa)).await.unwrap();

        blobs.delete(&aaa).await.unwrap();

        assert!(matches!(blobs.get(&aaa).await, Err(RegistryError::BlobNotFound(_))));
        assert_eq!(index.table("registry_blobs").count(aaa.as_str(), None).await.unwrap(), 0);

        // Deleting twice is harmless.
        blobs.delete(&aaa).await.unwrap();
    }

    #[tokio::test]
    async fn get_reads_bytes() {
        let (storage, _index, blobs) = setup().await;
        upload(&storage, "sha256:aaa", b"layer").await;
        assert_eq!(blobs.get(&digest("sha256:aaa")).await.unwrap(), b"layer");
        assert!(matches!(
            blobs.get(&digest("sha256:bbb")).await,
            Err(RegistryError::BlobNotFound(d)) if d == "sha256:bbb"
        ));
    }
}
