use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use tracing_error::SpanTrace;

/// What went wrong in a backend, independent of which backend it was.
///
/// Callers make correctness decisions on this value (an object that is
/// `NotFound` is absent, anything else is a failure), so drivers must pick
/// the kind carefully and never report a transport failure as `NotFound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The object, row, bucket or table does not exist.
    NotFound,

    /// A conditional write found its precondition violated.
    ///
    /// Not retryable: the state the caller reasoned about has changed.
    ConditionFailed,

    /// The caller is not allowed to perform the operation.
    PermissionDenied,

    /// Network or disk failure. May be transient.
    Io,

    /// The backend is temporarily unavailable or throttling.
    ServiceUnavailable,

    /// The request itself is malformed (for example, an oversized batch).
    InvalidRequest,

    /// A row or object could not be encoded or decoded.
    SerializationError,

    /// Retries were attempted and all failed.
    RetriesExhausted,

    /// Anything else.
    Other,
}

impl StorageErrorKind {
    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::ServiceUnavailable | StorageErrorKind::Io
        )
    }

    /// Whether the caller is at fault.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::InvalidRequest
                | StorageErrorKind::PermissionDenied
                | StorageErrorKind::SerializationError
        )
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::ConditionFailed => write!(f, "condition failed"),
            StorageErrorKind::PermissionDenied => write!(f, "permission denied"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::ServiceUnavailable => write!(f, "service unavailable"),
            StorageErrorKind::InvalidRequest => write!(f, "invalid request"),
            StorageErrorKind::SerializationError => write!(f, "serialization error"),
            StorageErrorKind::RetriesExhausted => write!(f, "retries exhausted"),
            StorageErrorKind::Other => write!(f, "other error"),
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    /// Controlled by `RUST_BACKTRACE`.
    backtrace: Backtrace,

    /// The tracing spans active when the error was created.
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// An error from an object store or index store backend.
///
/// Carries the semantic [`StorageErrorKind`], the engine that produced it,
/// the bucket or table and the object path or row key involved, and the
/// underlying error. A backtrace and a [`SpanTrace`] are captured at
/// construction.
///
/// ```rust
/// use storage_driver::{StorageError, StorageErrorKind};
///
/// let error = StorageError::builder(
///     "memory",
///     StorageErrorKind::NotFound,
///     std::io::Error::new(std::io::ErrorKind::NotFound, "no such object"),
/// )
/// .bucket("registry")
/// .path("blobs/sha256:aaa")
/// .build();
///
/// assert!(error.is_not_found());
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    engine: &'static str,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    traces: Box<ErrorTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create an error with no bucket, path or context.
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self::builder(engine, kind, error).build()
    }

    /// Start building an error; bucket, path and context are optional.
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder {
            engine,
            kind,
            source: error.into(),
            bucket: None,
            path: None,
            context: None,
        }
    }

    /// A closure for `map_err` which wraps a downstream error.
    ///
    /// ```rust
    /// use storage_driver::{StorageError, StorageErrorKind};
    ///
    /// fn decode(bytes: &[u8]) -> Result<String, StorageError> {
    ///     String::from_utf8(bytes.to_vec())
    ///         .map_err(StorageError::with("memory", StorageErrorKind::SerializationError))
    /// }
    /// # assert!(decode(&[0xff]).is_err());
    /// ```
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> impl FnOnce(E) -> StorageError
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        move |error: E| StorageError::new(engine, kind, error)
    }

    /// The semantic kind of this error.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// The engine which produced this error.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// The bucket or table involved, if known.
    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    /// The object path or row key involved, if known.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Additional context, if any.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Shorthand for `kind() == NotFound`.
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// Shorthand for `kind() == ConditionFailed`.
    pub fn is_condition_failed(&self) -> bool {
        self.kind == StorageErrorKind::ConditionFailed
    }

    /// See [`StorageErrorKind::is_retryable`].
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// The backtrace captured at construction.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// The span trace captured at construction.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(bucket) = &self.bucket {
            write!(f, " (bucket: {})", bucket)?;
        }

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder returned by [`StorageError::builder`].
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
}

impl StorageErrorBuilder {
    /// Set the bucket or table name.
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the object path or row key.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Finish the error, capturing traces.
    #[track_caller]
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            bucket: self.bucket,
            path: self.path,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_location() {
        let err = StorageError::builder(
            "memory",
            StorageErrorKind::ConditionFailed,
            "row already exists",
        )
        .bucket("registry_manifests")
        .path("app:v1")
        .build();

        assert_eq!(
            err.to_string(),
            "Storage error [condition failed] from memory (bucket: registry_manifests) (path: app:v1): row already exists"
        );
        assert!(err.is_condition_failed());
        assert!(!err.is_retryable());
    }

    #[test]
    fn io_is_retryable_not_found_is_not() {
        assert!(StorageErrorKind::Io.is_retryable());
        assert!(StorageErrorKind::ServiceUnavailable.is_retryable());
        assert!(!StorageErrorKind::NotFound.is_retryable());
        assert!(StorageErrorKind::InvalidRequest.is_client_fault());
    }
}
