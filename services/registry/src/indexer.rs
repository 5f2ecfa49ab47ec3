//! Records the reference edges between a manifest and the blobs it uses

use futures::future::try_join_all;
use storage::Condition;

use crate::blob::BlobStore;
use crate::digest::{Digest, ManifestName};
use crate::error::RegistryResult;
use crate::media::Manifest;
use crate::storage::{ReferenceEdge, RegistryStorage, ReverseReferenceEdge};

/// Writes forward and reverse reference edges for manifest bodies.
#[derive(Debug, Clone)]
pub struct ReferenceIndexer {
    storage: RegistryStorage,
    blobs: BlobStore,
}

impl ReferenceIndexer {
    /// Create an indexer.
    pub fn new(storage: RegistryStorage, blobs: BlobStore) -> Self {
        Self { storage, blobs }
    }

    /// Parse `body` and record an edge from `name` to every digest it
    /// depends on, returning those digests.
    ///
    /// Every reverse edge is written before any forward edge, so a forward
    /// edge never exists without its reverse. Rewriting the same manifest
    /// produces identical rows.
    #[tracing::instrument(skip(self, body), fields(%name, bytes = body.len()))]
    pub async fn index(&self, body: &[u8], name: &ManifestName) -> RegistryResult<Vec<Digest>> {
        let source = name.to_string();
        let manifest = Manifest::parse(body, &source)?;
        let digests = manifest.digests();
        tracing::debug!(media_type = %manifest.media_type(), references = digests.len(), "parsed manifest");

        if digests.is_empty() {
            return Ok(digests);
        }

        let present = self.blobs.exists(&digests).await?;

        try_join_all(digests.iter().map(|digest| {
            let edge = ReverseReferenceEdge {
                digest: digest.clone(),
                source: source.clone(),
            };
            let key = ReverseReferenceEdge::key(digest, &source);
            let table = self.storage.in_references();
            async move { table.put(&key, &edge, Condition::Always).await }
        }))
        .await?;

        try_join_all(digests.iter().map(|digest| {
            let edge = ReferenceEdge {
                source: source.clone(),
                digest: digest.clone(),
                found: present.contains(digest),
            };
            let key = ReferenceEdge::key(&source, digest);
            let table = self.storage.references();
            async move { table.put(&key, &edge, Condition::Always).await }
        }))
        .await?;

        let missing = digests.len() - present.len();
        if missing > 0 {
            tracing::warn!(missing, "manifest references blobs which do not exist yet");
        }
        tracing::info!(references = digests.len(), "indexed manifest");
        Ok(digests)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use storage::{Index, MemoryStorage, Storage};

    use super::*;
    use crate::config::RegistryConfig;
    use crate::error::RegistryError;

    async fn setup() -> (Index, ReferenceIndexer) {
        let config = RegistryConfig::default();
        let storage: Storage = MemoryStorage::with_buckets(&[&config.bucket]).into();
        let index = storage::IndexConfig::Memory
            .build(&config.tables.specs())
            .await
            .unwrap();
        let registry = RegistryStorage::new(&storage, &index, config);
        let blobs = BlobStore::new(registry.clone());
        (index, ReferenceIndexer::new(registry, blobs))
    }

    fn image(config: &str, layers: &[&str]) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {"digest": config},
            "layers": layers.iter().map(|d| json!({"digest": d})).collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn writes_both_edge_directions() {
        let (index, indexer) = setup().await;
        let name: ManifestName = "app:v1".parse().unwrap();

        let digests = indexer
            .index(&image("sha256:ccc", &["sha256:aaa", "sha256:bbb"]), &name)
            .await
            .unwrap();
        assert_eq!(digests.len(), 3);

        let forward: Vec<ReferenceEdge> =
            index.table("registry_references").query("app:v1").await.unwrap();
        assert_eq!(forward.len(), 3);
        assert!(forward.iter().all(|edge| !edge.found));

        for edge in &forward {
            let reverse: Vec<ReverseReferenceEdge> = index
                .table("registry_in_references")
                .query(edge.digest.as_str())
                .await
                .unwrap();
            assert_eq!(reverse.len(), 1);
            assert_eq!(reverse[0].source, "app:v1");
        }
    }

    #[tokio::test]
    async fn reindexing_is_idempotent() {
        let (index, indexer) = setup().await;
        let name: ManifestName = "app:v1".parse().unwrap();
        let body = image("sha256:ccc", &["sha256:aaa"]);

        indexer.index(&body, &name).await.unwrap();
        indexer.index(&body, &name).await.unwrap();

        assert_eq!(index.table("registry_references").count("app:v1", None).await.unwrap(), 2);
        assert_eq!(
            index.table("registry_in_references").count("sha256:aaa", None).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn image_configs_have_no_edges() {
        let (index, indexer) = setup().await;
        let name: ManifestName = "app:cfg".parse().unwrap();
        let body = serde_json::to_vec(&json!({"mediaType": "application/vnd.oci.image.config.v1+json"})).unwrap();

        assert!(indexer.index(&body, &name).await.unwrap().is_empty());
        assert_eq!(index.table("registry_references").count("app:cfg", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unsupported_types_write_nothing() {
        let (index, indexer) = setup().await;
        let name: ManifestName = "app:list".parse().unwrap();
        let body = serde_json::to_vec(&json!({
            "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
            "manifests": [{"digest": "sha256:aaa"}],
        }))
        .unwrap();

        let err = indexer.index(&body, &name).await.unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedMediaType(_)));
        assert_eq!(index.table("registry_references").count("app:list", None).await.unwrap(), 0);
    }
}
