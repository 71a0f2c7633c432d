//! Registry abstraction
//!
//! kiln talks to image storage through the [`Registry`] trait. The cache
//! store uses the same trait as a key/value database: each cache entry is a
//! tag in a cache repository.
//!
//! Implementations:
//! - [`LocalRegistry`]: blobs, manifests and tags on local disk
//! - [`MemoryRegistry`]: in-process store, used by tests and dry runs

mod local;
mod memory;

pub use local::LocalRegistry;
pub use memory::MemoryRegistry;

use crate::error::{KilnError, KilnResult};
use crate::image::{image_from_blobs, ConfigFile, Image, Manifest};
use crate::layer::sha256_digest;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;

/// A parsed image reference: `repository[:tag]` or `repository@digest`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    /// Repository path, including any registry host (e.g. "localhost:5000/app")
    pub repository: String,
    /// Tag or digest (e.g. "latest" or "sha256:abc123")
    pub reference: String,
}

impl ImageRef {
    /// Parse a raw image reference string.
    ///
    /// Supported formats:
    /// - `python`
    /// - `python:3.11-slim`
    /// - `localhost:5000/team/app:v1`
    /// - `team/app@sha256:abc123`
    pub fn parse(raw: &str) -> KilnResult<Self> {
        let raw = raw.trim();
        let invalid = |reason: &str| KilnError::ImageRefInvalid {
            reference: raw.to_string(),
            reason: reason.to_string(),
        };

        if raw.is_empty() {
            return Err(invalid("empty image reference"));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(invalid("whitespace is not allowed"));
        }

        let (repository, reference) = if let Some((name, digest)) = raw.split_once('@') {
            if !digest.starts_with("sha256:") {
                return Err(invalid("only sha256 digests are supported"));
            }
            (name, digest)
        } else {
            // A tag colon always comes after the last '/', otherwise it is a
            // registry port ("localhost:5000/repo").
            let after_last_slash = raw.rfind('/').map(|p| p + 1).unwrap_or(0);
            match raw.rfind(':') {
                Some(pos) if pos > after_last_slash => (&raw[..pos], &raw[pos + 1..]),
                _ => (raw, "latest"),
            }
        };

        if repository.is_empty() || reference.is_empty() {
            return Err(invalid("missing repository or tag"));
        }
        if repository.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(invalid("invalid repository path"));
        }

        Ok(Self {
            repository: repository.to_string(),
            reference: reference.to_string(),
        })
    }

    /// Reference to a tag in the given repository
    pub fn tagged(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            reference: tag.into(),
        }
    }

    /// Whether the reference is a content digest rather than a tag
    pub fn is_digest(&self) -> bool {
        self.reference.starts_with("sha256:")
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_digest() {
            write!(f, "{}@{}", self.repository, self.reference)
        } else {
            write!(f, "{}:{}", self.repository, self.reference)
        }
    }
}

/// Image storage operations needed by the builder and the cache
#[async_trait]
pub trait Registry: Send + Sync {
    /// Whether the reference resolves to an image
    async fn exists(&self, reference: &ImageRef) -> KilnResult<bool>;

    /// Fetch an image with all of its layer blobs.
    /// Fails with [`KilnError::ImageNotFound`] when the reference is unknown.
    async fn pull(&self, reference: &ImageRef) -> KilnResult<Image>;

    /// Store an image under a tag and return its manifest digest
    async fn push(&self, reference: &ImageRef, image: &Image) -> KilnResult<String>;

    /// All tags in a repository (empty when the repository is unknown)
    async fn tags(&self, repository: &str) -> KilnResult<BTreeSet<String>>;

    /// Remove a tag
    async fn delete(&self, reference: &ImageRef) -> KilnResult<()>;

    /// Human-readable backend name for display
    fn registry_name(&self) -> &'static str;
}

/// An image broken into the blobs a registry stores
pub(crate) struct EncodedImage {
    pub manifest_digest: String,
    pub manifest: Vec<u8>,
    /// Config blob first, then layer blobs in order
    pub blobs: Vec<(String, Vec<u8>)>,
}

pub(crate) fn encode_image(image: &Image) -> KilnResult<EncodedImage> {
    let manifest = image.manifest_bytes()?;
    let config = image.config_bytes()?;
    let mut blobs = Vec::with_capacity(image.layers().len() + 1);
    blobs.push((sha256_digest(&config), config));
    for layer in image.layers() {
        blobs.push((layer.digest().to_string(), layer.blob().to_vec()));
    }
    Ok(EncodedImage {
        manifest_digest: sha256_digest(&manifest),
        manifest,
        blobs,
    })
}

/// Rebuild an image from manifest bytes, fetching blobs by digest
pub(crate) fn decode_image<F>(manifest_bytes: &[u8], mut fetch: F) -> KilnResult<Image>
where
    F: FnMut(&str) -> KilnResult<Vec<u8>>,
{
    let manifest: Manifest = serde_json::from_slice(manifest_bytes)?;
    let config_bytes = fetch(&manifest.config.digest)?;
    let actual = sha256_digest(&config_bytes);
    if actual != manifest.config.digest {
        return Err(KilnError::DigestMismatch {
            expected: manifest.config.digest.clone(),
            actual,
        });
    }
    let config: ConfigFile = serde_json::from_slice(&config_bytes)?;
    image_from_blobs(&manifest, config, fetch)
}
