//! Content digests and manifest names

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::RegistryError;

/// An algorithm-prefixed content hash, e.g. `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// The sha256 digest of `data`.
    pub fn sha256(data: &[u8]) -> Self {
        use sha2::Digest as _;
        Self(format!("sha256:{}", hex::encode(Sha256::digest(data))))
    }

    /// The algorithm part, e.g. `sha256`.
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(alg, _)| alg).unwrap_or_default()
    }

    /// The encoded hash part.
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map(|(_, hex)| hex).unwrap_or_default()
    }

    /// The digest as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((algorithm, encoded)) = s.split_once(':') else {
            return Err(RegistryError::InvalidDigest(s.to_string()));
        };

        let valid_algorithm = !algorithm.is_empty()
            && algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c));
        let valid_encoded = !encoded.is_empty()
            && encoded
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "=_-".contains(c));

        if valid_algorithm && valid_encoded {
            Ok(Self(s.to_string()))
        } else {
            Err(RegistryError::InvalidDigest(s.to_string()))
        }
    }
}

impl TryFrom<String> for Digest {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The part of a manifest name after the repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    /// A mutable tag, e.g. `v1`.
    Tag(String),

    /// An immutable content digest.
    Digest(Digest),
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => f.write_str(tag),
            Reference::Digest(digest) => digest.fmt(f),
        }
    }
}

/// A manifest name: `repository:tag` or `repository:digest`.
///
/// The repository ends at the first `:` and may contain `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestName {
    repository: String,
    reference: Reference,
}

impl ManifestName {
    /// Build a name from its parts.
    pub fn new(repository: impl Into<String>, reference: Reference) -> Self {
        Self {
            repository: repository.into(),
            reference,
        }
    }

    /// The repository part.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The reference part.
    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// Whether this name addresses a manifest by digest.
    pub fn is_digest(&self) -> bool {
        matches!(self.reference, Reference::Digest(_))
    }

    /// The digest-addressed name in the same repository.
    pub fn alias(&self, digest: Digest) -> ManifestName {
        ManifestName::new(self.repository.clone(), Reference::Digest(digest))
    }
}

impl FromStr for ManifestName {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::InvalidName(s.to_string());

        let (repository, reference) = s.split_once(':').ok_or_else(invalid)?;
        if repository.is_empty()
            || reference.is_empty()
            || repository.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(invalid());
        }

        let reference = if reference.contains(':') {
            Reference::Digest(reference.parse().map_err(|_| invalid())?)
        } else if reference.contains('/') {
            return Err(invalid());
        } else {
            Reference::Tag(reference.to_string())
        };

        Ok(Self {
            repository: repository.to_string(),
            reference,
        })
    }
}

impl fmt::Display for ManifestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_bytes() {
        let digest = Digest::sha256(b"");
        assert_eq!(
            digest.as_str(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(digest.algorithm(), "sha256");
        assert_eq!(digest.encoded().len(), 64);
    }

    #[test]
    fn digest_parsing() {
        assert!("sha256:aaa".parse::<Digest>().is_ok());
        assert!("sha256:".parse::<Digest>().is_err());
        assert!(":aaa".parse::<Digest>().is_err());
        assert!("aaa".parse::<Digest>().is_err());
        assert!("sha256:../../etc".parse::<Digest>().is_err());
    }

    #[test]
    fn digest_serde_is_a_plain_string() {
        let digest: Digest = serde_json::from_str("\"sha256:aaa\"").unwrap();
        assert_eq!(serde_json::to_string(&digest).unwrap(), "\"sha256:aaa\"");
        assert!(serde_json::from_str::<Digest>("\"nope\"").is_err());
    }

    #[test]
    fn tag_and_digest_names() {
        let name: ManifestName = "library/app:v1".parse().unwrap();
        assert_eq!(name.repository(), "library/app");
        assert_eq!(name.reference(), &Reference::Tag("v1".into()));
        assert!(!name.is_digest());

        let alias = name.alias("sha256:aaa".parse().unwrap());
        assert_eq!(alias.to_string(), "library/app:sha256:aaa");
        assert!(alias.is_digest());

        let reparsed: ManifestName = alias.to_string().parse().unwrap();
        assert_eq!(reparsed, alias);
    }

    #[test]
    fn bad_names() {
        for bad in ["app", ":v1", "app:", "../app:v1", "app:v1/x", "app:sha256:"] {
            assert!(bad.parse::<ManifestName>().is_err(), "{bad} should not parse");
        }
    }
}
