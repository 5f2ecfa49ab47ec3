//! # Storage backends
//!
//! Backend-erased handles over the object store and the index store, the
//! configuration which selects a backend, and the in-memory backends.

use std::sync::Arc;

use camino::Utf8Path;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io;
use tokio::sync::broadcast;

pub(crate) mod memory;
pub(crate) mod memory_index;

#[doc(inline)]
pub use memory::MemoryStorage;

#[doc(inline)]
pub use memory_index::MemoryIndex;

#[doc(inline)]
pub use storage_driver::{
    Condition, Driver, IndexDriver, Item, Key, Metadata, ObjectEvent, ObjectEventKind, Reader,
    StorageError, StorageErrorKind, Tag, VersionId, Writer, MAX_BATCH_GET,
};

/// Selects and configures the object store backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Keep objects in process memory.
    Memory {
        /// The bucket to create up front.
        bucket: String,
    },
}

impl StorageConfig {
    /// Build the configured backend.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory { bucket } => MemoryStorage::with_buckets(&[&bucket]).into(),
        };
        Ok(client)
    }
}

/// A table an index backend must provide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    /// Table name.
    pub name: String,

    /// Attribute holding a unix-seconds expiry. Rows past it are treated
    /// as absent.
    pub ttl_attribute: Option<String>,
}

impl TableSpec {
    /// A table without expiry.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ttl_attribute: None,
        }
    }

    /// Expire rows by the given attribute.
    pub fn with_ttl(mut self, attribute: impl Into<String>) -> Self {
        self.ttl_attribute = Some(attribute.into());
        self
    }
}

/// Selects and configures the index store backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexConfig {
    /// Keep rows in process memory.
    Memory,
}

impl IndexConfig {
    /// Build the configured backend, providing the given tables.
    #[tracing::instrument(skip(tables))]
    pub async fn build(self, tables: &[TableSpec]) -> Result<Index, StorageError> {
        let index: Index = match self {
            IndexConfig::Memory => {
                let mut memory = MemoryIndex::new();
                for table in tables {
                    memory = memory.with_table(table.clone());
                }
                memory.into()
            }
        };
        Ok(index)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A shared handle on an object store backend.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The driver name.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// A handle bound to one bucket.
    pub fn bucket<S: Into<String>>(&self, bucket: S) -> StorageBucket {
        StorageBucket {
            driver: self.driver.clone(),
            bucket: bucket.into(),
        }
    }

    /// Subscribe to in-process change notifications, if the backend has them.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<ObjectEvent>> {
        self.driver.subscribe()
    }
}

/// An object store handle bound to one bucket.
#[derive(Debug, Clone)]
pub struct StorageBucket {
    /// The bucket name.
    pub bucket: String,
    driver: ArcDriver,
}

impl StorageBucket {
    /// The driver name.
    pub fn name(&self) -> &'static str {
        self.driver.name()
    }

    /// Metadata of the current version of an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(&self.bucket, remote).await
    }

    /// Read an object, the current version unless `version` is given.
    #[tracing::instrument(skip(self, writer), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn download<'d, W>(
        &'d self,
        remote: &Utf8Path,
        version: Option<&VersionId>,
        writer: &mut W,
    ) -> Result<(), StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, ?version, "Downloading from: {}/{remote}", self.bucket);
        self.driver
            .download(&self.bucket, remote, version, writer)
            .await
    }

    /// Write a new version of an object.
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn upload<'d, R>(
        &'d self,
        remote: &Utf8Path,
        reader: &mut R,
    ) -> Result<VersionId, StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Uploading to: {}/{remote}", self.bucket);
        self.driver.upload(&self.bucket, remote, reader).await
    }

    /// Delete an object, returning the delete marker version.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn delete(&self, remote: &Utf8Path) -> Result<VersionId, StorageError> {
        self.driver.delete(&self.bucket, remote).await
    }

    /// Replace the tags on an object version.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn tag(
        &self,
        remote: &Utf8Path,
        version: &VersionId,
        tags: &[Tag],
    ) -> Result<(), StorageError> {
        self.driver.tag(&self.bucket, remote, version, tags).await
    }

    /// List object keys under a prefix.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn list(&self, prefix: Option<&Utf8Path>) -> Result<Vec<String>, StorageError> {
        self.driver.list(&self.bucket, prefix).await
    }
}

pub(crate) type ArcIndexDriver = Arc<dyn IndexDriver + Send + Sync>;

/// A shared handle on an index store backend.
#[derive(Debug, Clone)]
pub struct Index {
    driver: ArcIndexDriver,
}

impl<D> From<D> for Index
where
    D: IndexDriver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Index::new(value)
    }
}

impl Index {
    /// Wrap a driver.
    pub fn new<D: IndexDriver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The driver name.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// A handle bound to one table.
    pub fn table<S: Into<String>>(&self, table: S) -> IndexTable {
        IndexTable {
            driver: self.driver.clone(),
            table: table.into(),
        }
    }
}

/// An index store handle bound to one table, reading and writing rows as
/// serde types.
#[derive(Debug, Clone)]
pub struct IndexTable {
    /// The table name.
    pub table: String,
    driver: ArcIndexDriver,
}

impl IndexTable {
    fn encode<T: Serialize>(&self, key: &Key, row: &T) -> Result<Item, StorageError> {
        let value = serde_json::to_value(row).map_err(|err| {
            StorageError::builder(self.driver.name(), StorageErrorKind::SerializationError, err)
                .bucket(&self.table)
                .path(key.to_string())
                .build()
        })?;

        match value {
            serde_json::Value::Object(item) => Ok(item),
            other => Err(StorageError::builder(
                self.driver.name(),
                StorageErrorKind::SerializationError,
                format!("row must serialize to an object, got {other}"),
            )
            .bucket(&self.table)
            .path(key.to_string())
            .build()),
        }
    }

    fn decode<T: DeserializeOwned>(&self, item: Item) -> Result<T, StorageError> {
        serde_json::from_value(serde_json::Value::Object(item)).map_err(|err| {
            StorageError::builder(self.driver.name(), StorageErrorKind::SerializationError, err)
                .bucket(&self.table)
                .build()
        })
    }

    /// Fetch one row.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), table=%self.table))]
    pub async fn get<T: DeserializeOwned>(&self, key: &Key) -> Result<Option<T>, StorageError> {
        self.driver
            .get(&self.table, key)
            .await?
            .map(|item| self.decode(item))
            .transpose()
    }

    /// Write one row, subject to `condition`.
    #[tracing::instrument(skip(self, row), fields(driver=self.driver.name(), table=%self.table))]
    pub async fn put<T: Serialize>(
        &self,
        key: &Key,
        row: &T,
        condition: Condition,
    ) -> Result<(), StorageError> {
        let item = self.encode(key, row)?;
        self.driver.put(&self.table, key, item, condition).await
    }

    /// Delete one row.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), table=%self.table))]
    pub async fn delete(&self, key: &Key) -> Result<(), StorageError> {
        self.driver.delete(&self.table, key).await
    }

    /// Fetch every row in a partition.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), table=%self.table))]
    pub async fn query<T: DeserializeOwned>(&self, partition: &str) -> Result<Vec<T>, StorageError> {
        self.driver
            .query(&self.table, partition, None)
            .await?
            .into_iter()
            .map(|item| self.decode(item))
            .collect()
    }

    /// Count rows in a partition, stopping at `limit`.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), table=%self.table))]
    pub async fn count(&self, partition: &str, limit: Option<usize>) -> Result<usize, StorageError> {
        self.driver.count(&self.table, partition, limit).await
    }

    /// Fetch rows by key in one round trip; see [`IndexDriver::batch_get`].
    #[tracing::instrument(skip(self, keys), fields(driver=self.driver.name(), table=%self.table, keys=keys.len()))]
    pub async fn batch_get<T: DeserializeOwned>(&self, keys: &[Key]) -> Result<Vec<T>, StorageError> {
        self.driver
            .batch_get(&self.table, keys)
            .await?
            .into_iter()
            .map(|item| self.decode(item))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires: Option<i64>,
    }

    #[tokio::test]
    async fn typed_rows_round_trip_through_the_driver() {
        let index: Index = MemoryIndex::with_tables(&["rows"]).into();
        let table = index.table("rows");
        let key = Key::new("app:v1");
        let row = Row {
            name: "app:v1".into(),
            expires: None,
        };

        table.put(&key, &row, Condition::KeyAbsent).await.unwrap();
        assert_eq!(table.get::<Row>(&key).await.unwrap(), Some(row));

        let err = table
            .put(&key, &Row { name: "app:v1".into(), expires: Some(1) }, Condition::KeyAbsent)
            .await
            .unwrap_err();
        assert!(err.is_condition_failed());
    }

    #[tokio::test]
    async fn non_object_rows_are_rejected() {
        let index: Index = MemoryIndex::with_tables(&["rows"]).into();
        let err = index
            .table("rows")
            .put(&Key::new("x"), &42u32, Condition::Always)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::SerializationError);
    }

    #[tokio::test]
    async fn config_builds_memory_backends() {
        let config: StorageConfig =
            serde_json::from_value(serde_json::json!({"memory": {"bucket": "registry"}})).unwrap();
        let storage = config.build().await.unwrap();
        assert_eq!(storage.name(), "memory");
        assert!(storage.subscribe().is_some());

        let config: IndexConfig = serde_json::from_value(serde_json::json!("memory")).unwrap();
        let index = config
            .build(&[TableSpec::new("manifests").with_ttl("expires")])
            .await
            .unwrap();
        assert_eq!(index.name(), "memory");
        assert_eq!(
            index.table("manifests").count("missing", None).await.unwrap(),
            0
        );
    }
}
