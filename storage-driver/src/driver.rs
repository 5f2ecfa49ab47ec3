use std::{fmt, ops::Deref, sync::Arc};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tokio::io;
use tokio::sync::broadcast;

use crate::error::StorageError;
use crate::event::ObjectEvent;

/// A reader stream for object contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + Sync + 'r;

/// A writer stream for object contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + Sync + 'w;

/// Identifies one write of an object.
///
/// Every upload and every delete produces a new version. Versions are
/// opaque strings; only the backend which issued one can interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionId(String);

impl VersionId {
    /// Wrap a backend-issued version string.
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// The version as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VersionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for VersionId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// A key/value tag attached to an object version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    /// Tag name.
    pub key: String,

    /// Tag value.
    pub value: String,
}

impl Tag {
    /// Create a new tag.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Metadata of the current version of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the object in bytes.
    pub size: u64,

    /// When this version was written.
    pub created: DateTime<Utc>,

    /// The current version.
    pub version: VersionId,
}

/// A versioned object store backend.
///
/// A missing object must be reported with
/// [`StorageErrorKind::NotFound`](crate::StorageErrorKind::NotFound) and
/// nothing else; callers treat every other error as a hard failure.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver, used in errors and spans.
    fn name(&self) -> &'static str;

    /// Get the metadata for the current version of an object.
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Write a new version of an object from a reader stream.
    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<VersionId, StorageError>;

    /// Read an object into a writer stream.
    ///
    /// With `version` unset, reads the current version.
    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        version: Option<&VersionId>,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError>;

    /// Delete an object, returning the version of the delete marker.
    ///
    /// Deleting an object which does not exist succeeds.
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<VersionId, StorageError>;

    /// Replace the tags on one version of an object.
    async fn tag(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        version: &VersionId,
        tags: &[Tag],
    ) -> Result<(), StorageError>;

    /// List the objects in a bucket, optionally filtered by a prefix.
    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError>;

    /// Subscribe to change notifications, if this backend delivers them
    /// in-process.
    fn subscribe(&self) -> Option<broadcast::Receiver<ObjectEvent>> {
        None
    }
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<VersionId, StorageError> {
        self.deref().upload(bucket, remote, reader).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        version: Option<&VersionId>,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.deref().download(bucket, remote, version, writer).await
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<VersionId, StorageError> {
        self.deref().delete(bucket, remote).await
    }

    async fn tag(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        version: &VersionId,
        tags: &[Tag],
    ) -> Result<(), StorageError> {
        self.deref().tag(bucket, remote, version, tags).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.deref().list(bucket, prefix).await
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ObjectEvent>> {
        self.deref().subscribe()
    }
}
