//! Manifest media types and bodies

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::digest::Digest;
use crate::error::RegistryError;

/// The media types the indexer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    /// `application/vnd.docker.distribution.manifest.v2+json`
    DockerManifestV2,

    /// `application/vnd.oci.image.manifest.v1+json`
    OciManifestV1,

    /// `application/vnd.docker.container.image.v1+json`
    DockerImageConfig,

    /// `application/vnd.oci.image.config.v1+json`
    OciImageConfig,
}

/// How a media type participates in the reference graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// Declares a config blob and layer blobs.
    Manifest,

    /// A leaf; declares nothing.
    ImageConfig,
}

impl MediaType {
    /// The registered media type string.
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::DockerManifestV2 => "application/vnd.docker.distribution.manifest.v2+json",
            MediaType::OciManifestV1 => "application/vnd.oci.image.manifest.v1+json",
            MediaType::DockerImageConfig => "application/vnd.docker.container.image.v1+json",
            MediaType::OciImageConfig => "application/vnd.oci.image.config.v1+json",
        }
    }

    /// How this media type participates in the reference graph.
    pub fn kind(&self) -> MediaKind {
        match self {
            MediaType::DockerManifestV2 | MediaType::OciManifestV1 => MediaKind::Manifest,
            MediaType::DockerImageConfig | MediaType::OciImageConfig => MediaKind::ImageConfig,
        }
    }
}

impl FromStr for MediaType {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            MediaType::DockerManifestV2,
            MediaType::OciManifestV1,
            MediaType::DockerImageConfig,
            MediaType::OciImageConfig,
        ]
        .into_iter()
        .find(|media| media.as_str() == s)
        .ok_or_else(|| RegistryError::UnsupportedMediaType(s.to_string()))
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Just enough of a manifest body to dispatch on.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
}

/// A content descriptor inside a manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct Descriptor {
    /// The referenced digest.
    pub digest: Digest,
}

/// An image manifest: one config blob and an ordered list of layers.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageManifest {
    /// The config blob.
    pub config: Descriptor,

    /// Layer blobs, base first.
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Every digest the manifest depends on, config first, without repeats.
    pub fn digests(&self) -> Vec<Digest> {
        let mut digests: Vec<Digest> = Vec::with_capacity(self.layers.len() + 1);
        for digest in std::iter::once(&self.config)
            .chain(&self.layers)
            .map(|d| &d.digest)
        {
            if !digests.contains(digest) {
                digests.push(digest.clone());
            }
        }
        digests
    }
}

/// A parsed manifest body.
#[derive(Debug, Clone)]
pub enum Manifest {
    /// An image manifest.
    Image {
        /// The declared media type.
        media_type: MediaType,
        /// The parsed body.
        manifest: ImageManifest,
    },

    /// An image config.
    Config {
        /// The declared media type.
        media_type: MediaType,
    },
}

impl Manifest {
    /// Parse a manifest body, dispatching on its declared `mediaType`.
    ///
    /// `name` is used only for error messages.
    pub fn parse(body: &[u8], name: &str) -> Result<Self, RegistryError> {
        let invalid = |err: serde_json::Error| RegistryError::InvalidManifest {
            name: name.to_string(),
            reason: err.to_string(),
        };

        let envelope: Envelope = serde_json::from_slice(body).map_err(invalid)?;
        let media_type: MediaType = envelope
            .media_type
            .ok_or_else(|| RegistryError::UnsupportedMediaType("<missing mediaType>".into()))?
            .parse()?;

        match media_type.kind() {
            MediaKind::Manifest => Ok(Manifest::Image {
                media_type,
                manifest: serde_json::from_slice(body).map_err(invalid)?,
            }),
            MediaKind::ImageConfig => Ok(Manifest::Config { media_type }),
        }
    }

    /// The declared media type.
    pub fn media_type(&self) -> MediaType {
        match self {
            Manifest::Image { media_type, .. } | Manifest::Config { media_type } => *media_type,
        }
    }

    /// Every digest this manifest depends on.
    pub fn digests(&self) -> Vec<Digest> {
        match self {
            Manifest::Image { manifest, .. } => manifest.digests(),
            Manifest::Config { .. } => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn image_manifest_digests() {
        let manifest = Manifest::parse(
            &body(json!({
                "schemaVersion": 2,
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": "sha256:ccc", "size": 1},
                "layers": [
                    {"digest": "sha256:aaa", "size": 2},
                    {"digest": "sha256:bbb", "size": 3},
                    {"digest": "sha256:aaa", "size": 2}
                ]
            })),
            "app:v1",
        )
        .unwrap();

        assert_eq!(manifest.media_type(), MediaType::OciManifestV1);
        let digests: Vec<String> = manifest.digests().into_iter().map(String::from).collect();
        assert_eq!(digests, vec!["sha256:ccc", "sha256:aaa", "sha256:bbb"]);
    }

    #[test]
    fn image_config_is_a_leaf() {
        let manifest = Manifest::parse(
            &body(json!({"mediaType": "application/vnd.docker.container.image.v1+json", "architecture": "amd64"})),
            "app:cfg",
        )
        .unwrap();
        assert!(manifest.digests().is_empty());
    }

    #[test]
    fn unknown_media_type() {
        let err = Manifest::parse(
            &body(json!({"mediaType": "application/vnd.oci.image.index.v1+json", "manifests": []})),
            "app:v1",
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedMediaType(t) if t == "application/vnd.oci.image.index.v1+json"));

        let err = Manifest::parse(&body(json!({"schemaVersion": 2})), "app:v1").unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedMediaType(_)));
    }

    #[test]
    fn malformed_bodies() {
        let err = Manifest::parse(b"not json", "app:v1").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidManifest { .. }));

        let err = Manifest::parse(
            &body(json!({"mediaType": "application/vnd.docker.distribution.manifest.v2+json", "layers": []})),
            "app:v1",
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidManifest { .. }));
    }
}
