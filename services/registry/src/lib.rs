//! # Artifact registry backing store
//!
//! Stores content-addressed blobs and named manifests in a versioned object
//! store, and keeps a reference graph between them in an index store so that
//! blobs are garbage collected once no manifest uses them.
//!
//! ## Components
//!
//! - [`BlobStore`]: blob reads, deletion, and batched existence checks backed
//!   by a durable existence cache.
//! - [`ReferenceIndexer`]: records forward and reverse edges from a manifest to
//!   the blobs it declares.
//! - [`GarbageCollector`]: removes a manifest's edges and deletes blobs whose
//!   reference count drops to zero.
//! - [`ManifestLifecycleHandler`]: reacts to manifest creation and deletion
//!   notifications, which may be delivered more than once.
//! - [`EventPump`]: delivers in-process notifications in per-key order and
//!   redelivers the ones that fail.
//! - [`Registry::router`]: the read-only HTTP path for manifests and blobs.
//!
//! ## Example
//!
//! ```no_run
//! use registry::RegistryBuilder;
//! use storage::{MemoryIndex, MemoryStorage};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["registry"]);
//! let registry = RegistryBuilder::new(storage.into(), MemoryIndex::new().into())
//!     .bucket("registry")
//!     .build();
//!
//! // Serve the read path with axum or any tower-compatible server
//! let app = registry.router();
//! # Ok(())
//! # }
//! ```

mod api;
mod blob;
mod config;
mod digest;
mod error;
mod event;
mod gc;
mod indexer;
mod lifecycle;
mod manifest;
mod media;
mod pump;
mod retry;
mod storage;

pub use api::{Registry, RegistryBuilder};
pub use blob::BlobStore;
pub use config::{ConflictPolicy, RegistryConfig, TableNames};
pub use digest::{Digest, ManifestName, Reference};
pub use error::{RegistryError, RegistryResult};
pub use event::{Notification, NotificationRecord};
pub use gc::{GarbageCollector, GcReport};
pub use indexer::ReferenceIndexer;
pub use lifecycle::{ManifestLifecycleHandler, ManifestState, Outcome};
pub use manifest::{ManifestBody, ManifestStore};
pub use media::{MediaKind, MediaType};
pub use pump::EventPump;
pub use retry::Backoff;
pub use crate::storage::{
    ExistenceRecord, ManifestRecord, ReferenceEdge, RegistryStorage, ReverseReferenceEdge,
};
