use std::fmt;

use crate::driver::VersionId;

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectEventKind {
    /// A new version of the object was written.
    Created,

    /// The object was deleted; the event version is the delete marker.
    Removed,
}

impl fmt::Display for ObjectEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectEventKind::Created => f.write_str("created"),
            ObjectEventKind::Removed => f.write_str("removed"),
        }
    }
}

/// A change notification for one object version.
///
/// Notifications may be delivered more than once and out of order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectEvent {
    /// The kind of change.
    pub kind: ObjectEventKind,

    /// The bucket holding the object.
    pub bucket: String,

    /// The object key.
    pub key: String,

    /// The version written by this change.
    pub version: VersionId,
}

impl ObjectEvent {
    /// Create a new event.
    pub fn new(
        kind: ObjectEventKind,
        bucket: impl Into<String>,
        key: impl Into<String>,
        version: VersionId,
    ) -> Self {
        Self {
            kind,
            bucket: bucket.into(),
            key: key.into(),
            version,
        }
    }
}
