//! Filesystem layers
//!
//! A [`Layer`] is an immutable gzip-compressed tar delta plus the config
//! overrides it carries into the final image. Its `diff_id` addresses the
//! uncompressed content and its `digest` the compressed blob; both are pure
//! functions of the bytes.

pub mod archive;

use crate::error::KilnResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

pub use archive::LayerArchive;

/// OCI media type for gzip layers
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// `sha256:<hex>` digest of a byte slice
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Image config values a layer contributes when it is appended.
///
/// `None` leaves the value inherited from earlier layers untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// An immutable, materialized filesystem layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    blob: Vec<u8>,
    diff_id: String,
    digest: String,
    overrides: LayerOverrides,
}

impl Layer {
    /// Build a layer from uncompressed tar bytes
    pub fn from_tar(tar_bytes: &[u8], overrides: LayerOverrides) -> KilnResult<Self> {
        let blob = archive::compress(tar_bytes)?;
        Ok(Self {
            diff_id: sha256_digest(tar_bytes),
            digest: sha256_digest(&blob),
            blob,
            overrides,
        })
    }

    /// Build a layer from a compressed blob, hashing its decompressed content
    pub fn from_blob(blob: Vec<u8>, overrides: LayerOverrides) -> KilnResult<Self> {
        let tar_bytes = archive::decompress(&blob)?;
        Ok(Self {
            diff_id: sha256_digest(&tar_bytes),
            digest: sha256_digest(&blob),
            blob,
            overrides,
        })
    }

    /// Rehydrate a layer whose diff_id is already recorded in an image config
    pub fn from_parts(blob: Vec<u8>, diff_id: String, overrides: LayerOverrides) -> Self {
        Self {
            digest: sha256_digest(&blob),
            diff_id,
            blob,
            overrides,
        }
    }

    /// Package a scratch directory. Paths in the layer are relative to `root`.
    pub fn from_directory(root: &Path, overrides: LayerOverrides) -> KilnResult<Self> {
        let mut archive = LayerArchive::new();
        archive.append_tree(root)?;
        Self::from_tar(&archive.finish()?, overrides)
    }

    /// Compressed blob bytes
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// sha256 of the uncompressed tar
    pub fn diff_id(&self) -> &str {
        &self.diff_id
    }

    /// sha256 of the compressed blob
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Compressed size in bytes
    pub fn size(&self) -> u64 {
        self.blob.len() as u64
    }

    pub fn overrides(&self) -> &LayerOverrides {
        &self.overrides
    }

    /// Same content with different overrides
    pub fn with_overrides(&self, overrides: LayerOverrides) -> Self {
        Self {
            overrides,
            ..self.clone()
        }
    }

    /// Paths contained in this layer, in archive order
    pub fn entries(&self) -> KilnResult<Vec<String>> {
        archive::entry_paths(&archive::decompress(&self.blob)?)
    }
}
