use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use tokio::sync::RwLock;

use storage_driver::{
    Condition, IndexDriver, Item, Key, StorageError, StorageErrorKind, MAX_BATCH_GET,
};

use crate::TableSpec;

const ENGINE: &str = "memory-index";

fn table_not_found(table: &str) -> StorageError {
    StorageError::builder(
        ENGINE,
        StorageErrorKind::NotFound,
        format!("Table not found: {table}"),
    )
    .bucket(table)
    .context("table not found")
    .build()
}

#[derive(Debug, Default)]
struct MemoryTable {
    rows: BTreeMap<Key, Item>,
    ttl_attribute: Option<String>,
}

impl MemoryTable {
    /// Rows whose TTL attribute is at or before `now` are gone, whether or
    /// not they have been swept yet.
    fn is_live(&self, item: &Item, now: i64) -> bool {
        let Some(attribute) = &self.ttl_attribute else {
            return true;
        };

        match item.get(attribute).and_then(serde_json::Value::as_i64) {
            Some(expires) => expires > now,
            None => true,
        }
    }

    fn live(&self, key: &Key, now: i64) -> Option<&Item> {
        self.rows.get(key).filter(|item| self.is_live(item, now))
    }

    fn partition<'t>(&'t self, partition: &str, now: i64) -> impl Iterator<Item = &'t Item> + 't {
        let partition = partition.to_owned();
        self.rows
            .range(Key::new(partition.clone())..)
            .take_while(move |(key, _)| key.partition == partition)
            .map(|(_, item)| item)
            .filter(move |item| self.is_live(item, now))
    }
}

/// An ordered index store which keeps everything in memory.
///
/// Tables must be declared up front; operations on undeclared tables fail
/// with [`StorageErrorKind::NotFound`].
#[derive(Debug, Default)]
pub struct MemoryIndex {
    tables: RwLock<HashMap<String, MemoryTable>>,
}

impl MemoryIndex {
    /// Create an index with no tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an index with the given tables, none of which expire rows.
    pub fn with_tables(tables: &[&str]) -> Self {
        tables
            .iter()
            .fold(Self::new(), |index, table| index.with_table(TableSpec::new(*table)))
    }

    /// Declare a table.
    pub fn with_table(mut self, spec: TableSpec) -> Self {
        self.tables.get_mut().insert(
            spec.name,
            MemoryTable {
                rows: BTreeMap::new(),
                ttl_attribute: spec.ttl_attribute,
            },
        );
        self
    }

    /// Every live row in a table, in key order.
    pub async fn rows(&self, table: &str) -> Vec<(Key, Item)> {
        let now = Utc::now().timestamp();
        let tables = self.tables.read().await;
        tables
            .get(table)
            .map(|t| {
                t.rows
                    .iter()
                    .filter(|(_, item)| t.is_live(item, now))
                    .map(|(key, item)| (key.clone(), item.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl IndexDriver for MemoryIndex {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn get(&self, table: &str, key: &Key) -> Result<Option<Item>, StorageError> {
        let now = Utc::now().timestamp();
        let tables = self.tables.read().await;
        let t = tables.get(table).ok_or_else(|| table_not_found(table))?;
        Ok(t.live(key, now).cloned())
    }

    async fn put(
        &self,
        table: &str,
        key: &Key,
        item: Item,
        condition: Condition,
    ) -> Result<(), StorageError> {
        let now = Utc::now().timestamp();
        let mut tables = self.tables.write().await;
        let t = tables.get_mut(table).ok_or_else(|| table_not_found(table))?;

        if condition == Condition::KeyAbsent && t.live(key, now).is_some() {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::ConditionFailed,
                "a row already exists under this key",
            )
            .bucket(table)
            .path(key.to_string())
            .build());
        }

        tracing::trace!(%table, %key, "put row");
        t.rows.insert(key.clone(), item);
        Ok(())
    }

    async fn delete(&self, table: &str, key: &Key) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        let t = tables.get_mut(table).ok_or_else(|| table_not_found(table))?;
        tracing::trace!(%table, %key, "delete row");
        t.rows.remove(key);
        Ok(())
    }

    async fn query(
        &self,
        table: &str,
        partition: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Item>, StorageError> {
        let now = Utc::now().timestamp();
        let tables = self.tables.read().await;
        let t = tables.get(table).ok_or_else(|| table_not_found(table))?;
        Ok(t
            .partition(partition, now)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn count(
        &self,
        table: &str,
        partition: &str,
        limit: Option<usize>,
    ) -> Result<usize, StorageError> {
        let now = Utc::now().timestamp();
        let tables = self.tables.read().await;
        let t = tables.get(table).ok_or_else(|| table_not_found(table))?;
        Ok(t.partition(partition, now)
            .take(limit.unwrap_or(usize::MAX))
            .count())
    }

    async fn batch_get(&self, table: &str, keys: &[Key]) -> Result<Vec<Item>, StorageError> {
        if keys.len() > MAX_BATCH_GET {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::InvalidRequest,
                format!("batch of {} keys exceeds {MAX_BATCH_GET}", keys.len()),
            )
            .bucket(table)
            .build());
        }

        let now = Utc::now().timestamp();
        let tables = self.tables.read().await;
        let t = tables.get(table).ok_or_else(|| table_not_found(table))?;
        Ok(keys
            .iter()
            .filter_map(|key| t.live(key, now))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(value: serde_json::Value) -> Item {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn query_stays_inside_the_partition() {
        let index = MemoryIndex::with_tables(&["refs"]);
        for (source, digest) in [("app:v1", "a"), ("app:v1", "b"), ("app:v10", "c"), ("app:v2", "d")] {
            index
                .put(
                    "refs",
                    &Key::with_sort(source, digest),
                    item(json!({"source": source, "digest": digest})),
                    Condition::Always,
                )
                .await
                .unwrap();
        }

        let rows = index.query("refs", "app:v1", None).await.unwrap();
        let digests: Vec<_> = rows.iter().map(|r| r["digest"].as_str().unwrap()).collect();
        assert_eq!(digests, vec!["a", "b"]);

        assert_eq!(index.count("refs", "app:v1", Some(1)).await.unwrap(), 1);
        assert_eq!(index.count("refs", "app:v3", Some(1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn key_absent_condition() {
        let index = MemoryIndex::with_tables(&["manifests"]);
        let key = Key::new("app:v1");

        index
            .put("manifests", &key, item(json!({"name": "app:v1"})), Condition::KeyAbsent)
            .await
            .unwrap();

        let err = index
            .put("manifests", &key, item(json!({"name": "app:v1"})), Condition::KeyAbsent)
            .await
            .unwrap_err();
        assert!(err.is_condition_failed());

        index
            .put("manifests", &key, item(json!({"name": "app:v1", "expires": 5})), Condition::Always)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expired_rows_are_absent() {
        let index = MemoryIndex::new().with_table(TableSpec::new("manifests").with_ttl("expires"));
        let key = Key::new("app:v1");
        let past = Utc::now().timestamp() - 10;
        let future = Utc::now().timestamp() + 3600;

        index
            .put("manifests", &key, item(json!({"name": "app:v1", "expires": past})), Condition::Always)
            .await
            .unwrap();
        assert_eq!(index.get("manifests", &key).await.unwrap(), None);

        // An expired row does not block a conditional write.
        index
            .put("manifests", &key, item(json!({"name": "app:v1", "expires": future})), Condition::KeyAbsent)
            .await
            .unwrap();
        assert!(index.get("manifests", &key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn batch_get_is_bounded() {
        let index = MemoryIndex::with_tables(&["blobs"]);
        index
            .put("blobs", &Key::new("sha256:aaa"), item(json!({"digest": "sha256:aaa"})), Condition::Always)
            .await
            .unwrap();

        let found = index
            .batch_get("blobs", &[Key::new("sha256:aaa"), Key::new("sha256:ccc")])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let keys: Vec<_> = (0..=MAX_BATCH_GET).map(|i| Key::new(i.to_string())).collect();
        let err = index.batch_get("blobs", &keys).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn undeclared_tables_are_not_found() {
        let index = MemoryIndex::new();
        let err = index.get("nope", &Key::new("x")).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
