use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{
    io::AsyncWriteExt,
    sync::{broadcast, RwLock},
};

use storage_driver::{
    Driver, Metadata, ObjectEvent, ObjectEventKind, Reader, StorageError, StorageErrorKind, Tag,
    VersionId, Writer,
};

const ENGINE: &str = "memory";

/// How many undelivered notifications a slow subscriber may fall behind.
const NOTIFICATION_BUFFER: usize = 1024;

fn io_error_to_storage(err: std::io::Error) -> StorageError {
    let kind = match err.kind() {
        std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
        std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
        _ => StorageErrorKind::Io,
    };
    StorageError::new(ENGINE, kind, err)
}

fn bucket_not_found(bucket: &str) -> StorageError {
    StorageError::builder(
        ENGINE,
        StorageErrorKind::NotFound,
        format!("Bucket not found: {bucket}"),
    )
    .bucket(bucket)
    .context("bucket not found")
    .build()
}

fn object_not_found(bucket: &str, remote: &Utf8Path, version: Option<&VersionId>) -> StorageError {
    let builder = StorageError::builder(
        ENGINE,
        StorageErrorKind::NotFound,
        format!("Path not found: {remote}"),
    )
    .bucket(bucket)
    .path(remote.as_str());

    match version {
        Some(version) => builder.context(format!("version {version} not found")),
        None => builder.context("path not found"),
    }
    .build()
}

#[derive(Debug)]
struct MemoryObjectVersion {
    version: VersionId,
    created: DateTime<Utc>,
    /// `None` marks a deletion.
    data: Option<Vec<u8>>,
    tags: Vec<Tag>,
}

impl MemoryObjectVersion {
    fn metadata(&self) -> Option<Metadata> {
        self.data.as_ref().map(|data| Metadata {
            size: data.len() as u64,
            created: self.created,
            version: self.version.clone(),
        })
    }
}

/// Every version of every object in a bucket, oldest first.
type MemoryBucket = HashMap<Utf8PathBuf, Vec<MemoryObjectVersion>>;

/// A versioned object store which keeps everything in memory.
///
/// Each upload and delete appends a new version with a monotonically
/// increasing id and publishes an [`ObjectEvent`] to subscribers.
#[derive(Debug)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, MemoryBucket>>,
    sequence: AtomicU64,
    events: broadcast::Sender<ObjectEvent>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        let (events, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            buckets: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            events,
        }
    }
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance, with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` instance, with the given buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let map = buckets
            .iter()
            .map(|bucket| (bucket.to_string(), MemoryBucket::new()))
            .collect();

        Self {
            buckets: RwLock::new(map),
            ..Self::default()
        }
    }

    /// Create a new bucket in the storage.
    pub async fn create_bucket(&self, bucket: String) {
        let mut buckets = self.buckets.write().await;
        buckets.entry(bucket).or_default();
    }

    /// The tags on one version of an object.
    pub async fn tags(&self, bucket: &str, remote: &Utf8Path, version: &VersionId) -> Option<Vec<Tag>> {
        let buckets = self.buckets.read().await;
        buckets
            .get(bucket)?
            .get(remote)?
            .iter()
            .find(|v| &v.version == version)
            .map(|v| v.tags.clone())
    }

    fn next_version(&self) -> VersionId {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        VersionId::new(format!("{n:016}"))
    }

    fn publish(&self, kind: ObjectEventKind, bucket: &str, remote: &Utf8Path, version: &VersionId) {
        let event = ObjectEvent::new(kind, bucket, remote.as_str(), version.clone());
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let buckets = self.buckets.read().await;
        let bucket_map = buckets.get(bucket).ok_or_else(|| bucket_not_found(bucket))?;
        bucket_map
            .get(remote)
            .and_then(|versions| versions.last())
            .and_then(MemoryObjectVersion::metadata)
            .ok_or_else(|| object_not_found(bucket, remote, None))
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<VersionId, StorageError> {
        let mut buf = Vec::new();

        tokio::io::copy(local, &mut buf)
            .await
            .map_err(io_error_to_storage)?;

        buf.shutdown().await.map_err(io_error_to_storage)?;

        let version = {
            let mut buckets = self.buckets.write().await;
            let bucket_map = buckets.entry(bucket.to_string()).or_default();
            let version = self.next_version();
            bucket_map
                .entry(remote.to_owned())
                .or_default()
                .push(MemoryObjectVersion {
                    version: version.clone(),
                    created: Utc::now(),
                    data: Some(buf),
                    tags: Vec::new(),
                });
            version
        };

        self.publish(ObjectEventKind::Created, bucket, remote, &version);
        Ok(version)
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        version: Option<&VersionId>,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let buckets = self.buckets.read().await;
        let bucket_map = buckets.get(bucket).ok_or_else(|| bucket_not_found(bucket))?;
        let versions = bucket_map
            .get(remote)
            .ok_or_else(|| object_not_found(bucket, remote, version))?;

        let found = match version {
            Some(version) => versions.iter().find(|v| &v.version == version),
            None => versions.last(),
        };

        let mut buf = found
            .and_then(|v| v.data.as_deref())
            .ok_or_else(|| object_not_found(bucket, remote, version))?;

        tokio::io::copy(&mut buf, local)
            .await
            .map_err(io_error_to_storage)?;

        local.flush().await.map_err(io_error_to_storage)?;

        Ok(())
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<VersionId, StorageError> {
        let version = {
            let mut buckets = self.buckets.write().await;
            let bucket_map = buckets
                .get_mut(bucket)
                .ok_or_else(|| bucket_not_found(bucket))?;

            let versions = bucket_map.entry(remote.to_owned()).or_default();
            let version = self.next_version();
            versions.push(MemoryObjectVersion {
                version: version.clone(),
                created: Utc::now(),
                data: None,
                tags: Vec::new(),
            });
            version
        };

        self.publish(ObjectEventKind::Removed, bucket, remote, &version);
        Ok(version)
    }

    async fn tag(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        version: &VersionId,
        tags: &[Tag],
    ) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| bucket_not_found(bucket))?;

        let target = bucket_map
            .get_mut(remote)
            .and_then(|versions| versions.iter_mut().find(|v| &v.version == version))
            .ok_or_else(|| object_not_found(bucket, remote, Some(version)))?;
        target.tags = tags.to_vec();

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let bucket_map = buckets.get(bucket).ok_or_else(|| bucket_not_found(bucket))?;

        let mut paths: Vec<String> = bucket_map
            .iter()
            .filter(|(_, versions)| versions.last().is_some_and(|v| v.data.is_some()))
            .map(|(path, _)| path)
            .filter(|path| prefix.map_or(true, |prefix| path.as_str().starts_with(prefix.as_str())))
            .map(|path| path.to_string())
            .collect();
        paths.sort();

        Ok(paths)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ObjectEvent>> {
        Some(self.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn put(storage: &MemoryStorage, remote: &str, data: &[u8]) -> VersionId {
        let mut reader = data;
        storage
            .upload("test", Utf8Path::new(remote), &mut reader)
            .await
            .unwrap()
    }

    async fn get(storage: &MemoryStorage, remote: &str, version: Option<&VersionId>) -> Result<Vec<u8>, StorageError> {
        let mut out = Vec::new();
        storage
            .download("test", Utf8Path::new(remote), version, &mut out)
            .await?;
        Ok(out)
    }

    #[tokio::test]
    async fn versions_are_monotonic_and_readable() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        let v1 = put(&storage, "manifests/app:v1", b"one").await;
        let v2 = put(&storage, "manifests/app:v1", b"two").await;
        assert!(v1 < v2);

        assert_eq!(get(&storage, "manifests/app:v1", None).await.unwrap(), b"two");
        assert_eq!(get(&storage, "manifests/app:v1", Some(&v1)).await.unwrap(), b"one");

        let meta = storage
            .metadata("test", Utf8Path::new("manifests/app:v1"))
            .await
            .unwrap();
        assert_eq!(meta.version, v2);
        assert_eq!(meta.size, 3);
    }

    #[tokio::test]
    async fn delete_leaves_a_marker_and_keeps_old_versions() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        let v1 = put(&storage, "blobs/sha256:aaa", b"layer").await;
        let marker = storage
            .delete("test", Utf8Path::new("blobs/sha256:aaa"))
            .await
            .unwrap();
        assert!(v1 < marker);

        let err = storage
            .metadata("test", Utf8Path::new("blobs/sha256:aaa"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(get(&storage, "blobs/sha256:aaa", None).await.unwrap_err().is_not_found());
        assert_eq!(get(&storage, "blobs/sha256:aaa", Some(&v1)).await.unwrap(), b"layer");
        assert!(storage.list("test", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_bucket_is_not_found() {
        let storage = MemoryStorage::new();
        let err = storage
            .metadata("nope", Utf8Path::new("x"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.bucket(), Some("nope"));
    }

    #[tokio::test]
    async fn tags_attach_to_a_single_version() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        let v1 = put(&storage, "manifests/app:v1", b"one").await;
        let v2 = put(&storage, "manifests/app:v1", b"two").await;

        storage
            .tag("test", Utf8Path::new("manifests/app:v1"), &v1, &[Tag::new("indexed", "10")])
            .await
            .unwrap();

        let path = Utf8Path::new("manifests/app:v1");
        assert_eq!(
            storage.tags("test", path, &v1).await,
            Some(vec![Tag::new("indexed", "10")])
        );
        assert_eq!(storage.tags("test", path, &v2).await, Some(vec![]));
    }

    #[tokio::test]
    async fn writes_are_published() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        let mut events = storage.subscribe().unwrap();

        let created = put(&storage, "manifests/app:v1", b"one").await;
        let removed = storage
            .delete("test", Utf8Path::new("manifests/app:v1"))
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.kind, ObjectEventKind::Created);
        assert_eq!(first.key, "manifests/app:v1");
        assert_eq!(first.version, created);

        let second = events.recv().await.unwrap();
        assert_eq!(second.kind, ObjectEventKind::Removed);
        assert_eq!(second.version, removed);
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        put(&storage, "manifests/app:v1", b"m").await;
        put(&storage, "blobs/sha256:aaa", b"b").await;

        let listed = storage
            .list("test", Some(Utf8Path::new("manifests/")))
            .await
            .unwrap();
        assert_eq!(listed, vec!["manifests/app:v1".to_string()]);
    }
}
