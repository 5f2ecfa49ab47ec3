//! Object store notification envelopes
//!
//! Notifications arrive as S3-style JSON batches:
//!
//! ```json
//! {"Records": [{"eventSource": "aws:s3", "eventName": "ObjectCreated:Put",
//!   "s3": {"bucket": {"name": "registry"},
//!          "object": {"key": "manifests/app%3Av1", "versionId": "3"}}}]}
//! ```
//!
//! Object keys are form-URL-encoded, so `+` is a space.

use percent_encoding::percent_decode_str;
use serde::Deserialize;
use storage::{ObjectEvent, ObjectEventKind, VersionId};

use crate::error::RegistryResult;
use crate::lifecycle::{ManifestLifecycleHandler, Outcome};

const EVENT_SOURCE: &str = "aws:s3";
const CREATED_PREFIX: &str = "ObjectCreated:";
const DELETE_MARKER_CREATED: &str = "ObjectRemoved:DeleteMarkerCreated";

/// A batch of notifications.
#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    /// The records in delivery order.
    #[serde(rename = "Records", default)]
    pub records: Vec<NotificationRecord>,
}

/// One notification record.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    /// The service which emitted the record.
    #[serde(default)]
    pub event_source: String,

    /// What happened, e.g. `ObjectCreated:Put`.
    pub event_name: String,

    /// The object the record is about.
    pub s3: S3Entity,
}

/// The bucket and object of a record.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Entity {
    /// The bucket.
    pub bucket: BucketEntity,

    /// The object.
    pub object: ObjectEntity,
}

/// A bucket reference.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketEntity {
    /// Bucket name.
    pub name: String,
}

/// An object reference.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectEntity {
    /// The URL-encoded object key.
    pub key: String,

    /// The version written by the change.
    #[serde(default)]
    pub version_id: Option<String>,
}

impl Notification {
    /// Parse a notification batch.
    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// The records which describe manifest lifecycle changes.
    pub fn events(&self) -> impl Iterator<Item = ObjectEvent> + '_ {
        self.records.iter().filter_map(NotificationRecord::to_event)
    }

    /// Handle every record in order, stopping at the first failure so the
    /// batch is redelivered.
    #[tracing::instrument(skip_all, fields(records = self.records.len()))]
    pub async fn dispatch(&self, handler: &ManifestLifecycleHandler) -> RegistryResult<Vec<Outcome>> {
        let mut outcomes = Vec::with_capacity(self.records.len());
        for event in self.events() {
            outcomes.push(handler.handle(&event).await?);
        }
        Ok(outcomes)
    }
}

impl NotificationRecord {
    /// The event kind this record maps to, if any.
    pub fn kind(&self) -> Option<ObjectEventKind> {
        if self.event_source != EVENT_SOURCE {
            return None;
        }

        if self.event_name.starts_with(CREATED_PREFIX) {
            Some(ObjectEventKind::Created)
        } else if self.event_name == DELETE_MARKER_CREATED {
            Some(ObjectEventKind::Removed)
        } else {
            None
        }
    }

    /// The decoded object key.
    pub fn key(&self) -> Option<String> {
        let plus_decoded = self.s3.object.key.replace('+', " ");
        match percent_decode_str(&plus_decoded).decode_utf8() {
            Ok(key) => Some(key.into_owned()),
            Err(err) => {
                tracing::warn!(key = %self.s3.object.key, "undecodable object key: {err}");
                None
            }
        }
    }

    /// Convert to an object event, or `None` if this record is not one the
    /// lifecycle handler acts on.
    pub fn to_event(&self) -> Option<ObjectEvent> {
        let Some(kind) = self.kind() else {
            tracing::debug!(source = %self.event_source, name = %self.event_name, "ignoring record");
            return None;
        };

        let Some(version) = self.s3.object.version_id.as_deref() else {
            tracing::warn!(key = %self.s3.object.key, "ignoring record without a version");
            return None;
        };

        Some(ObjectEvent::new(
            kind,
            self.s3.bucket.name.clone(),
            self.key()?,
            VersionId::from(version),
        ))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(source: &str, name: &str, key: &str, version: Option<&str>) -> serde_json::Value {
        json!({
            "eventVersion": "2.1",
            "eventSource": source,
            "eventName": name,
            "s3": {
                "bucket": {"name": "registry", "arn": "arn:aws:s3:::registry"},
                "object": {"key": key, "size": 12, "versionId": version},
            },
        })
    }

    fn parse(records: Vec<serde_json::Value>) -> Notification {
        let data = serde_json::to_vec(&json!({ "Records": records })).unwrap();
        Notification::from_slice(&data).unwrap()
    }

    #[test]
    fn classifies_records() {
        let notification = parse(vec![
            record("aws:s3", "ObjectCreated:Put", "manifests/app:v1", Some("1")),
            record("aws:s3", "ObjectCreated:CompleteMultipartUpload", "manifests/app:v2", Some("2")),
            record("aws:s3", "ObjectRemoved:DeleteMarkerCreated", "manifests/app:v1", Some("3")),
            record("aws:s3", "ObjectRemoved:Delete", "manifests/app:v1", Some("4")),
            record("aws:sqs", "ObjectCreated:Put", "manifests/app:v3", Some("5")),
            record("aws:s3", "ObjectCreated:Put", "manifests/app:v4", None),
        ]);

        let events: Vec<ObjectEvent> = notification.events().collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, ObjectEventKind::Created);
        assert_eq!(events[1].key, "manifests/app:v2");
        assert_eq!(events[2].kind, ObjectEventKind::Removed);
        assert_eq!(events[2].version.as_str(), "3");
        assert_eq!(events[2].bucket, "registry");
    }

    #[test]
    fn decodes_keys() {
        let notification = parse(vec![record(
            "aws:s3",
            "ObjectCreated:Put",
            "manifests/library%2Fapp%3Asha256%3Aabc+def",
            Some("1"),
        )]);
        let event = notification.events().next().unwrap();
        assert_eq!(event.key, "manifests/library/app:sha256:abc def");
    }

    #[test]
    fn empty_batches() {
        let notification = Notification::from_slice(b"{}").unwrap();
        assert_eq!(notification.events().count(), 0);
        assert!(Notification::from_slice(b"[]").is_err());
    }
}
