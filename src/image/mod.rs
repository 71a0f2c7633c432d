//! Logical container images
//!
//! An [`Image`] is an ordered list of layers plus an OCI config. Manifest and
//! config are serialized as sorted-key JSON so that identical inputs always
//! produce an identical manifest digest.

pub mod assemble;
pub mod sink;

use crate::error::{KilnError, KilnResult};
use crate::layer::{sha256_digest, Layer, LayerOverrides, MEDIA_TYPE_LAYER_GZIP};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub use assemble::{append, compose};
pub use sink::OutputSink;

// ---------------------------------------------------------------------------
// Media type constants
// ---------------------------------------------------------------------------

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// An OCI image manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType")]
    pub media_type: String,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,
}

/// A content-addressable blob reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,

    pub digest: String,

    pub size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    fn new(media_type: &str, digest: String, size: u64) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest,
            size,
            annotations: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// The OCI image config blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub created: DateTime<Utc>,

    pub architecture: String,

    pub os: String,

    #[serde(default)]
    pub config: RuntimeConfig,

    pub rootfs: RootFs,

    #[serde(default)]
    pub history: Vec<History>,
}

/// Container runtime settings inside the config blob
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,

    #[serde(rename = "ExposedPorts", default, skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,

    #[serde(rename = "WorkingDir", default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(rename = "Labels", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl RuntimeConfig {
    /// Look up an environment variable
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|kv| {
            kv.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }
}

/// Filesystem section: the ordered diff_ids of all layers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,

    pub diff_ids: Vec<String>,
}

/// One history record per appended layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub created: DateTime<Utc>,

    pub created_by: String,
}

/// Serialize a value as JSON with object keys in sorted order
pub fn canonical_json<T: Serialize>(value: &T) -> KilnResult<Vec<u8>> {
    // serde_json::Value maps are BTreeMaps, so round-tripping sorts every key.
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

/// An ordered set of layers plus their config
#[derive(Debug, Clone)]
pub struct Image {
    layers: Vec<Arc<Layer>>,
    config: ConfigFile,
}

impl Image {
    /// An image with no layers, used for `FROM scratch` style builds
    pub fn scratch() -> Self {
        Self {
            layers: Vec::new(),
            config: ConfigFile {
                created: DateTime::<Utc>::UNIX_EPOCH,
                architecture: "amd64".to_string(),
                os: "linux".to_string(),
                config: RuntimeConfig::default(),
                rootfs: RootFs {
                    fs_type: "layers".to_string(),
                    diff_ids: Vec::new(),
                },
                history: Vec::new(),
            },
        }
    }

    /// Build an image from layers and a config, checking that the config's
    /// diff_ids describe exactly these layers in this order.
    pub fn from_parts(layers: Vec<Arc<Layer>>, config: ConfigFile) -> KilnResult<Self> {
        if layers.len() != config.rootfs.diff_ids.len() {
            return Err(KilnError::Composition(format!(
                "config lists {} diff_ids for {} layers",
                config.rootfs.diff_ids.len(),
                layers.len()
            )));
        }
        for (layer, diff_id) in layers.iter().zip(&config.rootfs.diff_ids) {
            if layer.diff_id() != diff_id {
                return Err(KilnError::Composition(format!(
                    "layer {} does not match diff_id {}",
                    layer.diff_id(),
                    diff_id
                )));
            }
        }
        Ok(Self { layers, config })
    }

    /// Layers in application order (bottom first)
    pub fn layers(&self) -> &[Arc<Layer>] {
        &self.layers
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.config.created
    }

    /// Replace the config creation time
    pub fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.config.created = created;
        self
    }

    pub fn diff_ids(&self) -> &[String] {
        &self.config.rootfs.diff_ids
    }

    /// The most recently appended layer
    pub fn top_layer(&self) -> Option<&Arc<Layer>> {
        self.layers.last()
    }

    /// Find a layer by the diff_id recorded in the config
    pub fn layer_by_diff_id(&self, diff_id: &str) -> KilnResult<&Arc<Layer>> {
        self.layers
            .iter()
            .find(|l| l.diff_id() == diff_id)
            .ok_or_else(|| {
                KilnError::Composition(format!("no layer with diff_id {}", diff_id))
            })
    }

    /// Canonical config blob bytes
    pub fn config_bytes(&self) -> KilnResult<Vec<u8>> {
        canonical_json(&self.config)
    }

    /// Manifest describing the config blob and every layer blob
    pub fn manifest(&self) -> KilnResult<Manifest> {
        let config_bytes = self.config_bytes()?;
        Ok(Manifest {
            schema_version: 2,
            media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
            config: Descriptor::new(
                MEDIA_TYPE_OCI_CONFIG,
                sha256_digest(&config_bytes),
                config_bytes.len() as u64,
            ),
            layers: self
                .layers
                .iter()
                .map(|l| Descriptor::new(MEDIA_TYPE_LAYER_GZIP, l.digest().to_string(), l.size()))
                .collect(),
        })
    }

    /// Canonical manifest bytes
    pub fn manifest_bytes(&self) -> KilnResult<Vec<u8>> {
        canonical_json(&self.manifest()?)
    }

    /// Manifest digest identifying this image
    pub fn digest(&self) -> KilnResult<String> {
        Ok(sha256_digest(&self.manifest_bytes()?))
    }

    pub(crate) fn push_layer(&mut self, layer: Arc<Layer>) {
        self.config.rootfs.diff_ids.push(layer.diff_id().to_string());
        self.layers.push(layer);
    }

    pub(crate) fn config_mut(&mut self) -> &mut ConfigFile {
        &mut self.config
    }
}

/// Rebuild layers from a manifest, its config and the referenced blobs.
///
/// `blob` resolves a digest to bytes. Used by registry implementations.
pub fn image_from_blobs<F>(manifest: &Manifest, config: ConfigFile, mut blob: F) -> KilnResult<Image>
where
    F: FnMut(&str) -> KilnResult<Vec<u8>>,
{
    if manifest.layers.len() != config.rootfs.diff_ids.len() {
        return Err(KilnError::Composition(format!(
            "manifest lists {} layers but config lists {} diff_ids",
            manifest.layers.len(),
            config.rootfs.diff_ids.len()
        )));
    }
    let mut layers = Vec::with_capacity(manifest.layers.len());
    for (desc, diff_id) in manifest.layers.iter().zip(&config.rootfs.diff_ids) {
        let bytes = blob(&desc.digest)?;
        let actual = sha256_digest(&bytes);
        if actual != desc.digest {
            return Err(KilnError::DigestMismatch {
                expected: desc.digest.clone(),
                actual,
            });
        }
        layers.push(Arc::new(Layer::from_parts(
            bytes,
            diff_id.clone(),
            LayerOverrides::default(),
        )));
    }
    Image::from_parts(layers, config)
}
