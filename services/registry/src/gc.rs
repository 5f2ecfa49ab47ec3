//! Reference-counting garbage collection of blobs

use crate::blob::BlobStore;
use crate::digest::Digest;
use crate::error::RegistryResult;
use crate::storage::{ReferenceEdge, RegistryStorage, ReverseReferenceEdge};

/// What one collection removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Edge pairs removed.
    pub edges: usize,

    /// Blobs deleted because nothing referenced them any more.
    pub deleted: Vec<Digest>,
}

/// Removes a manifest's edges and any blob left unreferenced.
#[derive(Debug, Clone)]
pub struct GarbageCollector {
    storage: RegistryStorage,
    blobs: BlobStore,
}

impl GarbageCollector {
    /// Create a collector.
    pub fn new(storage: RegistryStorage, blobs: BlobStore) -> Self {
        Self { storage, blobs }
    }

    /// Remove every forward edge of `source`, deleting blobs whose last
    /// reverse edge goes with it.
    ///
    /// Queries until no forward edges remain. Terminates only if nothing
    /// adds edges for `source` concurrently.
    #[tracing::instrument(skip(self))]
    pub async fn collect_all(&self, source: &str) -> RegistryResult<GcReport> {
        let mut report = GcReport::default();

        loop {
            let edges: Vec<ReferenceEdge> = self.storage.references().query(source).await?;
            if edges.is_empty() {
                break;
            }
            tracing::debug!(edges = edges.len(), "collecting edges");

            for edge in edges {
                if self.collect(&edge).await? {
                    report.deleted.push(edge.digest);
                }
                report.edges += 1;
            }
        }

        tracing::info!(edges = report.edges, deleted = report.deleted.len(), "collected manifest");
        Ok(report)
    }

    /// Remove one edge pair. Returns whether the blob was deleted.
    ///
    /// The reverse edge goes first and the forward edge last, so an
    /// interrupted collection is picked up again by the next query.
    async fn collect(&self, edge: &ReferenceEdge) -> RegistryResult<bool> {
        let digest = &edge.digest;
        self.storage
            .in_references()
            .delete(&ReverseReferenceEdge::key(digest, &edge.source))
            .await?;

        let remaining = self
            .storage
            .in_references()
            .count(digest.as_str(), Some(1))
            .await?;

        let deleted = if remaining == 0 {
            self.blobs.delete(digest).await?;
            true
        } else {
            tracing::trace!(%digest, "blob still referenced");
            false
        };

        self.storage
            .references()
            .delete(&ReferenceEdge::key(&edge.source, digest))
            .await?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;
    use serde_json::json;
    use storage::{Index, MemoryStorage, Storage};

    use super::*;
    use crate::config::RegistryConfig;
    use crate::indexer::ReferenceIndexer;

    struct Fixture {
        storage: Storage,
        index: Index,
        indexer: ReferenceIndexer,
        gc: GarbageCollector,
    }

    async fn setup() -> Fixture {
        let config = RegistryConfig::default();
        let storage: Storage = MemoryStorage::with_buckets(&[&config.bucket]).into();
        let index = storage::IndexConfig::Memory
            .build(&config.tables.specs())
            .await
            .unwrap();
        let registry = RegistryStorage::new(&storage, &index, config);
        let blobs = BlobStore::new(registry.clone());
        Fixture {
            indexer: ReferenceIndexer::new(registry.clone(), blobs.clone()),
            gc: GarbageCollector::new(registry, blobs),
            storage,
            index,
        }
    }

    impl Fixture {
        async fn upload_blob(&self, digest: &str) {
            let mut reader: &[u8] = b"content";
            self.storage
                .bucket("registry")
                .upload(Utf8Path::new(&format!("blobs/{digest}")), &mut reader)
                .await
                .unwrap();
        }

        async fn index(&self, name: &str, layers: &[&str]) {
            let body = serde_json::to_vec(&json!({
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "config": {"digest": "sha256:cfg"},
                "layers": layers.iter().map(|d| json!({"digest": d})).collect::<Vec<_>>(),
            }))
            .unwrap();
            self.indexer.index(&body, &name.parse().unwrap()).await.unwrap();
        }

        async fn blob_exists(&self, digest: &str) -> bool {
            self.storage
                .bucket("registry")
                .metadata(Utf8Path::new(&format!("blobs/{digest}")))
                .await
                .is_ok()
        }
    }

    #[tokio::test]
    async fn deletes_only_unshared_blobs() {
        let fx = setup().await;
        for digest in ["sha256:cfg", "sha256:aaa", "sha256:bbb"] {
            fx.upload_blob(digest).await;
        }
        fx.index("app:v1", &["sha256:aaa", "sha256:bbb"]).await;
        fx.index("app:v2", &["sha256:aaa"]).await;

        let report = fx.gc.collect_all("app:v1").await.unwrap();
        assert_eq!(report.edges, 3);
        assert_eq!(report.deleted, vec!["sha256:bbb".parse::<Digest>().unwrap()]);

        assert!(fx.blob_exists("sha256:aaa").await);
        assert!(fx.blob_exists("sha256:cfg").await);
        assert!(!fx.blob_exists("sha256:bbb").await);
        assert_eq!(fx.index.table("registry_references").count("app:v1", None).await.unwrap(), 0);
        assert_eq!(
            fx.index.table("registry_in_references").count("sha256:aaa", None).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn last_referencer_takes_everything() {
        let fx = setup().await;
        fx.upload_blob("sha256:aaa").await;
        fx.index("app:v1", &["sha256:aaa"]).await;

        let report = fx.gc.collect_all("app:v1").await.unwrap();
        assert_eq!(report.edges, 2);
        assert_eq!(report.deleted.len(), 2);
        assert!(!fx.blob_exists("sha256:aaa").await);
        assert_eq!(fx.index.table("registry_blobs").count("sha256:aaa", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn nothing_to_collect() {
        let fx = setup().await;
        assert_eq!(fx.gc.collect_all("app:none").await.unwrap(), GcReport::default());
    }

    #[tokio::test]
    async fn resumes_after_a_partial_collection() {
        let fx = setup().await;
        fx.upload_blob("sha256:aaa").await;
        fx.index("app:v1", &["sha256:aaa"]).await;

        // A crash after the reverse edge went but before the forward edge did.
        let aaa: Digest = "sha256:aaa".parse().unwrap();
        fx.index
            .table("registry_in_references")
            .delete(&ReverseReferenceEdge::key(&aaa, "app:v1"))
            .await
            .unwrap();

        let report = fx.gc.collect_all("app:v1").await.unwrap();
        assert!(report.deleted.contains(&aaa));
        assert_eq!(fx.index.table("registry_references").count("app:v1", None).await.unwrap(), 0);
    }
}
