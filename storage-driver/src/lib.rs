//! Backend traits for the registry: a versioned object store and an ordered
//! index store, sharing one error type.

mod driver;
mod error;
mod event;
mod index;

pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Reader;
pub use driver::Tag;
pub use driver::VersionId;
pub use driver::Writer;
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
pub use event::{ObjectEvent, ObjectEventKind};
pub use index::{Condition, IndexDriver, Item, Key, MAX_BATCH_GET};
