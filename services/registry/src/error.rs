//! Error types for the registry

use std::time::Duration;

use axum::http::StatusCode;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Manifest not found, or tombstoned
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Invalid manifest name
    #[error("invalid manifest name: {0}")]
    InvalidName(String),

    /// The manifest body could not be interpreted
    #[error("invalid manifest {name}: {reason}")]
    InvalidManifest {
        /// Manifest name
        name: String,
        /// What was wrong with it
        reason: String,
    },

    /// The manifest declares a media type the indexer does not know
    #[error("unsupported manifest type: {0}")]
    UnsupportedMediaType(String),

    /// A tombstone write lost a race against a concurrent creation
    #[error("manifest {0} was modified concurrently")]
    ConcurrentModification(String),

    /// Storage error, never reinterpreted
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// The event did not finish within its time budget
    #[error("event processing timed out after {0:?}")]
    Timeout(Duration),
}

impl RegistryError {
    /// Get the HTTP status code for this error on the read path
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::BlobNotFound(_) | RegistryError::ManifestNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            RegistryError::InvalidDigest(_) | RegistryError::InvalidName(_) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the event may succeed if processed again unchanged
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistryError::Storage(err) => err.is_retryable(),
            RegistryError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Whether the event should be delivered again later. A lost tombstone
    /// race resolves itself on redelivery, once the racing record is observed.
    pub fn is_redeliverable(&self) -> bool {
        self.is_retryable() || matches!(self, RegistryError::ConcurrentModification(_))
    }
}
