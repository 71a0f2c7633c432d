//! On-disk registry
//!
//! Layout under the root directory:
//!
//! ```text
//! blobs/sha256/<hex>                      config, layer and manifest blobs
//! repositories/<repo>/tags/<tag>          file holding a manifest digest
//! ```
//!
//! Writes go to a temporary file first and are renamed into place, so a
//! concurrent reader never sees a half-written blob or tag.

use crate::error::{KilnError, KilnResult};
use crate::image::Image;
use crate::registry::{decode_image, encode_image, ImageRef, Registry};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, trace};

/// Registry stored in a local directory
pub struct LocalRegistry {
    root: PathBuf,
}

impl LocalRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &str) -> KilnResult<PathBuf> {
        let hex = digest
            .strip_prefix("sha256:")
            .filter(|h| !h.is_empty() && h.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| KilnError::Registry(format!("invalid digest '{}'", digest)))?;
        Ok(self.root.join("blobs").join("sha256").join(hex))
    }

    fn tags_dir(&self, repository: &str) -> PathBuf {
        let mut path = self.root.join("repositories");
        for part in repository.split('/') {
            path.push(part);
        }
        path.join("tags")
    }

    async fn read_optional(path: &Path) -> KilnResult<Option<Vec<u8>>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KilnError::Registry(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> KilnResult<()> {
        let parent = path
            .parent()
            .ok_or_else(|| KilnError::Internal(format!("{} has no parent", path.display())))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| KilnError::io(format!("creating {}", parent.display()), e))?;

        let tmp = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, bytes)
            .await
            .map_err(|e| KilnError::io(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| KilnError::io(format!("renaming into {}", path.display()), e))
    }

    /// Resolve a tag or digest reference to a manifest digest
    async fn resolve(&self, reference: &ImageRef) -> KilnResult<Option<String>> {
        if reference.is_digest() {
            let exists = fs::try_exists(self.blob_path(&reference.reference)?)
                .await
                .unwrap_or(false);
            return Ok(exists.then(|| reference.reference.clone()));
        }
        let tag_path = self.tags_dir(&reference.repository).join(&reference.reference);
        Ok(Self::read_optional(&tag_path)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string()))
    }
}

#[async_trait]
impl Registry for LocalRegistry {
    async fn exists(&self, reference: &ImageRef) -> KilnResult<bool> {
        Ok(self.resolve(reference).await?.is_some())
    }

    async fn pull(&self, reference: &ImageRef) -> KilnResult<Image> {
        let digest = self
            .resolve(reference)
            .await?
            .ok_or_else(|| KilnError::ImageNotFound(reference.to_string()))?;
        let manifest = Self::read_optional(&self.blob_path(&digest)?)
            .await?
            .ok_or_else(|| KilnError::ImageNotFound(reference.to_string()))?;

        // Collect every referenced blob up front; decoding itself is synchronous.
        let parsed: crate::image::Manifest = serde_json::from_slice(&manifest)?;
        let mut blobs = HashMap::new();
        for desc in std::iter::once(&parsed.config).chain(parsed.layers.iter()) {
            let bytes = Self::read_optional(&self.blob_path(&desc.digest)?)
                .await?
                .ok_or_else(|| KilnError::Registry(format!("blob {} missing", desc.digest)))?;
            blobs.insert(desc.digest.clone(), bytes);
        }
        trace!(reference = %reference, blobs = blobs.len(), "pulled image");

        decode_image(&manifest, |digest| {
            blobs
                .remove(digest)
                .ok_or_else(|| KilnError::Registry(format!("blob {} missing", digest)))
        })
    }

    async fn push(&self, reference: &ImageRef, image: &Image) -> KilnResult<String> {
        let encoded = encode_image(image)?;
        for (digest, bytes) in &encoded.blobs {
            let path = self.blob_path(digest)?;
            if !fs::try_exists(&path).await.unwrap_or(false) {
                Self::write_atomic(&path, bytes).await?;
            }
        }
        Self::write_atomic(&self.blob_path(&encoded.manifest_digest)?, &encoded.manifest).await?;

        if !reference.is_digest() {
            let tag_path = self.tags_dir(&reference.repository).join(&reference.reference);
            Self::write_atomic(&tag_path, encoded.manifest_digest.as_bytes()).await?;
        }
        debug!(reference = %reference, digest = %encoded.manifest_digest, "pushed image");
        Ok(encoded.manifest_digest)
    }

    async fn tags(&self, repository: &str) -> KilnResult<BTreeSet<String>> {
        let dir = self.tags_dir(repository);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(KilnError::io(format!("listing {}", dir.display()), e)),
        };

        let mut tags = BTreeSet::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| KilnError::io(format!("listing {}", dir.display()), e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(".tmp-") {
                tags.insert(name);
            }
        }
        Ok(tags)
    }

    async fn delete(&self, reference: &ImageRef) -> KilnResult<()> {
        let tag_path = self.tags_dir(&reference.repository).join(&reference.reference);
        match fs::remove_file(&tag_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KilnError::io(format!("removing {}", tag_path.display()), e)),
        }
    }

    fn registry_name(&self) -> &'static str {
        "local"
    }
}
