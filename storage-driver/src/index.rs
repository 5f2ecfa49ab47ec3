use std::{fmt, ops::Deref, sync::Arc};

use crate::error::StorageError;

/// The most keys a single [`IndexDriver::batch_get`] call may carry.
pub const MAX_BATCH_GET: usize = 100;

/// A row in an index table: a JSON object of attributes.
pub type Item = serde_json::Map<String, serde_json::Value>;

/// The primary key of a row.
///
/// Rows are ordered by partition, then sort key, so all rows sharing a
/// partition are contiguous and can be range-queried.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    /// Partition key.
    pub partition: String,

    /// Sort key, for tables with a composite key.
    pub sort: Option<String>,
}

impl Key {
    /// A key for a table with only a partition key.
    pub fn new(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: None,
        }
    }

    /// A key for a table with a composite key.
    pub fn with_sort(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: Some(sort.into()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sort {
            Some(sort) => write!(f, "{}/{}", self.partition, sort),
            None => f.write_str(&self.partition),
        }
    }
}

/// Precondition for [`IndexDriver::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Condition {
    /// Overwrite whatever is there.
    #[default]
    Always,

    /// Only write if no row exists under the key. Violations fail with
    /// [`StorageErrorKind::ConditionFailed`](crate::StorageErrorKind::ConditionFailed).
    KeyAbsent,
}

/// An ordered key-value index store.
///
/// Each single-row write is atomic. Nothing spans rows: callers that need
/// multi-row consistency must order their writes.
#[async_trait::async_trait]
pub trait IndexDriver: fmt::Debug {
    /// The name of the driver, used in errors and spans.
    fn name(&self) -> &'static str;

    /// Fetch a single row.
    async fn get(&self, table: &str, key: &Key) -> Result<Option<Item>, StorageError>;

    /// Write a single row, subject to `condition`.
    async fn put(
        &self,
        table: &str,
        key: &Key,
        item: Item,
        condition: Condition,
    ) -> Result<(), StorageError>;

    /// Delete a single row. Deleting a missing row succeeds.
    async fn delete(&self, table: &str, key: &Key) -> Result<(), StorageError>;

    /// Fetch rows in a partition, in sort key order.
    async fn query(
        &self,
        table: &str,
        partition: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Item>, StorageError>;

    /// Count rows in a partition, stopping at `limit`.
    async fn count(
        &self,
        table: &str,
        partition: &str,
        limit: Option<usize>,
    ) -> Result<usize, StorageError>;

    /// Fetch up to [`MAX_BATCH_GET`] rows by key. Missing rows are omitted
    /// and the result order is unspecified.
    async fn batch_get(&self, table: &str, keys: &[Key]) -> Result<Vec<Item>, StorageError>;
}

#[async_trait::async_trait]
impl<D> IndexDriver for Arc<D>
where
    D: ?Sized + IndexDriver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn get(&self, table: &str, key: &Key) -> Result<Option<Item>, StorageError> {
        self.deref().get(table, key).await
    }

    async fn put(
        &self,
        table: &str,
        key: &Key,
        item: Item,
        condition: Condition,
    ) -> Result<(), StorageError> {
        self.deref().put(table, key, item, condition).await
    }

    async fn delete(&self, table: &str, key: &Key) -> Result<(), StorageError> {
        self.deref().delete(table, key).await
    }

    async fn query(
        &self,
        table: &str,
        partition: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Item>, StorageError> {
        self.deref().query(table, partition, limit).await
    }

    async fn count(
        &self,
        table: &str,
        partition: &str,
        limit: Option<usize>,
    ) -> Result<usize, StorageError> {
        self.deref().count(table, partition, limit).await
    }

    async fn batch_get(&self, table: &str, keys: &[Key]) -> Result<Vec<Item>, StorageError> {
        self.deref().batch_get(table, keys).await
    }
}
