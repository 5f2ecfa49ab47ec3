//! Registry builder and the read-only HTTP router

use std::error::Error as _;
use std::fmt::Write as _;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use serde_json::json;
use storage::{Index, Storage};

use crate::blob::BlobStore;
use crate::config::RegistryConfig;
use crate::digest::{Digest, ManifestName};
use crate::error::RegistryError;
use crate::lifecycle::ManifestLifecycleHandler;
use crate::manifest::ManifestStore;
use crate::storage::RegistryStorage;

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Registry builder for configuring and creating the registry
#[derive(Debug)]
pub struct RegistryBuilder {
    storage: Storage,
    index: Index,
    config: RegistryConfig,
}

impl RegistryBuilder {
    /// Create a new registry builder over an object store and an index store
    pub fn new(storage: Storage, index: Index) -> Self {
        Self {
            storage,
            index,
            config: RegistryConfig::default(),
        }
    }

    /// Replace the configuration
    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.config.bucket = bucket.into();
        self
    }

    /// Include error details in 500 responses
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Build the registry
    pub fn build(self) -> Registry {
        let storage = RegistryStorage::new(&self.storage, &self.index, self.config);
        Registry {
            blobs: BlobStore::new(storage.clone()),
            manifests: ManifestStore::new(storage.clone()),
            handler: ManifestLifecycleHandler::new(storage.clone()),
            storage,
        }
    }
}

/// A configured registry: the read path and the lifecycle handler over
/// shared storage.
#[derive(Debug, Clone)]
pub struct Registry {
    storage: RegistryStorage,
    blobs: BlobStore,
    manifests: ManifestStore,
    handler: ManifestLifecycleHandler,
}

impl Registry {
    /// The read path, as a router that can be served with any
    /// tower-compatible server
    pub fn router(&self) -> Router {
        Router::new()
            .route("/v2/", get(api_version_check))
            .route("/v2/{*path}", any(route))
            .fallback(not_found)
            .with_state(self.clone())
    }

    /// The lifecycle handler for object store notifications
    pub fn handler(&self) -> &ManifestLifecycleHandler {
        &self.handler
    }

    /// Blob access
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Manifest lookups
    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// The underlying storage
    pub fn storage(&self) -> &RegistryStorage {
        &self.storage
    }

    fn error(&self, error: RegistryError) -> ApiError {
        ApiError {
            error,
            debug: self.storage.config().debug,
        }
    }
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

/// The resource a read path URL names.
#[derive(Debug, PartialEq, Eq)]
enum Target<'p> {
    Manifest { repository: &'p str, reference: &'p str },
    Blob { digest: &'p str },
}

impl<'p> Target<'p> {
    /// Parse `<repository>/(manifests|blobs)/<suffix>`, where the
    /// repository may itself contain slashes.
    fn parse(path: &'p str) -> Option<Self> {
        let mut parts = path.rsplitn(3, '/');
        let suffix = parts.next().filter(|s| !s.is_empty())?;
        let action = parts.next()?;
        let repository = parts.next().filter(|s| !s.is_empty())?;

        match action {
            "manifests" => Some(Target::Manifest {
                repository,
                reference: suffix,
            }),
            "blobs" => Some(Target::Blob { digest: suffix }),
            _ => None,
        }
    }
}

async fn route(
    State(registry): State<Registry>,
    method: Method,
    Path(path): Path<String>,
) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response();
    }

    let response = match Target::parse(&path) {
        Some(Target::Manifest {
            repository,
            reference,
        }) => get_manifest(&registry, repository, reference).await,
        Some(Target::Blob { digest }) => get_blob(&registry, digest).await,
        None => return not_found().await,
    };

    let response = response.unwrap_or_else(|error| registry.error(error).into_response());
    if method == Method::HEAD {
        let (parts, _) = response.into_parts();
        Response::from_parts(parts, axum::body::Body::empty())
    } else {
        response
    }
}

/// Serve a manifest through the index
#[tracing::instrument(skip(registry))]
async fn get_manifest(
    registry: &Registry,
    repository: &str,
    reference: &str,
) -> Result<Response, RegistryError> {
    let name: ManifestName = format!("{repository}:{reference}")
        .parse()
        .map_err(|_| RegistryError::ManifestNotFound(format!("{repository}:{reference}")))?;

    let manifest = registry.manifests.get(&name.to_string()).await?;
    let mut response = (StatusCode::OK, manifest.body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&manifest.media_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Ok(digest) = HeaderValue::from_str(manifest.digest.as_str()) {
        headers.insert(DOCKER_CONTENT_DIGEST, digest);
    }
    Ok(response)
}

/// Serve blob bytes straight from the object store
#[tracing::instrument(skip(registry))]
async fn get_blob(registry: &Registry, digest: &str) -> Result<Response, RegistryError> {
    let digest: Digest = digest
        .parse()
        .map_err(|_| RegistryError::BlobNotFound(digest.to_string()))?;
    let data = registry.blobs.get(&digest).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::HeaderName::from_static(DOCKER_CONTENT_DIGEST), digest.to_string()),
        ],
        data,
    )
        .into_response())
}

/// A read path failure, rendered as plain text.
#[derive(Debug)]
struct ApiError {
    error: RegistryError,
    debug: bool,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.error.status_code();
        if status == StatusCode::NOT_FOUND {
            let body = match self.error {
                RegistryError::BlobNotFound(_) => "Unknown blob",
                _ => "Unknown image",
            };
            return (status, body).into_response();
        }

        tracing::error!("read path failure: {}", self.error);
        let body = if self.debug {
            let mut body = self.error.to_string();
            let mut source = self.error.source();
            while let Some(cause) = source {
                let _ = write!(body, "\ncaused by: {cause}");
                source = cause.source();
            }
            body
        } else {
            "Internal Server Error".to_string()
        };
        (status, body).into_response()
    }
}
