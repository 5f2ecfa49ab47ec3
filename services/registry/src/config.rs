//! Typed configuration, read once at startup

use std::time::Duration;

use serde::Deserialize;
use storage::{TableSpec, MAX_BATCH_GET};

use crate::retry::Backoff;

/// What to do when a tombstone write loses a race against a creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Run the creation transition again for the object's current version
    /// and report the deletion as superseded. No collection ran, so this
    /// only repeats what the racing creation's own event does.
    #[default]
    Reindex,

    /// Fail the event with `ConcurrentModification`.
    Fail,
}

/// Names of the index tables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TableNames {
    /// Manifest records, aliases and tombstones, keyed by `name`.
    pub manifests: String,

    /// Forward edges, keyed by `source` then `digest`.
    pub references: String,

    /// Reverse edges, keyed by `digest` then `source`.
    pub in_references: String,

    /// Existence records, keyed by `digest`.
    pub blobs: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            manifests: "registry_manifests".into(),
            references: "registry_references".into(),
            in_references: "registry_in_references".into(),
            blobs: "registry_blobs".into(),
        }
    }
}

impl TableNames {
    /// The tables an index backend must provide. Manifest tombstones expire
    /// through the `expires` attribute.
    pub fn specs(&self) -> Vec<TableSpec> {
        vec![
            TableSpec::new(&self.manifests).with_ttl("expires"),
            TableSpec::new(&self.references),
            TableSpec::new(&self.in_references),
            TableSpec::new(&self.blobs),
        ]
    }
}

/// Registry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// The object store bucket holding manifests and blobs.
    pub bucket: String,

    /// Key prefix of manifest objects.
    pub manifest_prefix: String,

    /// Key prefix of blob objects.
    pub blob_prefix: String,

    /// Index table names.
    pub tables: TableNames,

    /// How long a tombstone outlives a deleted manifest, in seconds.
    pub tombstone_ttl_secs: u64,

    /// Keys per existence-cache round trip.
    pub batch_size: usize,

    /// Time budget for processing one event, in seconds.
    pub event_timeout_secs: u64,

    /// Behaviour when a deletion races a creation.
    pub on_conflict: ConflictPolicy,

    /// Retry policy for transient storage errors within one event.
    pub retry: Backoff,

    /// How often, and how patiently, the in-process event pump delivers a
    /// failed event again.
    pub redelivery: Backoff,

    /// Include error details in read path responses.
    pub debug: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bucket: "registry".into(),
            manifest_prefix: "manifests/".into(),
            blob_prefix: "blobs/".into(),
            tables: TableNames::default(),
            tombstone_ttl_secs: 3600,
            batch_size: MAX_BATCH_GET,
            event_timeout_secs: 60,
            on_conflict: ConflictPolicy::default(),
            retry: Backoff::default(),
            redelivery: Backoff {
                attempts: 10,
                delay_ms: 1_000,
                exponent: 2,
                max_delay_ms: 60_000,
            },
            debug: false,
        }
    }
}

impl RegistryConfig {
    /// Parse configuration from TOML.
    pub fn from_toml(text: &str) -> Result<Self, toml_edit::de::Error> {
        toml_edit::de::from_str(text)
    }

    /// Tombstone lifetime.
    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_secs(self.tombstone_ttl_secs)
    }

    /// Per-event time budget.
    pub fn event_timeout(&self) -> Duration {
        Duration::from_secs(self.event_timeout_secs)
    }

    /// Existence-cache batch size, clamped to what the index store accepts.
    pub fn batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_BATCH_GET)
    }
}
