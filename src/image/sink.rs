//! Output sinks
//!
//! The composed image either goes to a registry under the target reference or
//! into an OCI image-layout tarball on disk. The two are mutually exclusive
//! per build.

use crate::error::{KilnError, KilnResult};
use crate::image::{canonical_json, Descriptor, Image, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST};
use crate::layer::{sha256_digest, LayerArchive};
use crate::registry::{encode_image, ImageRef, Registry};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Annotation carrying the tag inside an OCI layout index
const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Where a finished image is delivered
#[derive(Clone)]
pub enum OutputSink {
    /// Push to a registry under `reference`
    Registry {
        registry: Arc<dyn Registry>,
        reference: ImageRef,
    },
    /// Write an OCI image layout tarball
    Tarball { path: PathBuf, reference: ImageRef },
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registry {
                registry,
                reference,
            } => write!(f, "Registry({}, {})", registry.registry_name(), reference),
            Self::Tarball { path, reference } => {
                write!(f, "Tarball({}, {})", path.display(), reference)
            }
        }
    }
}

impl OutputSink {
    /// Deliver the image and return its manifest digest
    pub async fn deliver(&self, image: &Image) -> KilnResult<String> {
        match self {
            Self::Registry {
                registry,
                reference,
            } => {
                let digest = registry.push(reference, image).await?;
                info!(reference = %reference, digest = %digest, "pushed image");
                Ok(digest)
            }
            Self::Tarball { path, reference } => {
                let bytes = layout_tarball(image, reference)?;
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| KilnError::io(format!("creating {}", parent.display()), e))?;
                }
                tokio::fs::write(path, bytes)
                    .await
                    .map_err(|e| KilnError::io(format!("writing {}", path.display()), e))?;
                let digest = image.digest()?;
                info!(path = %path.display(), digest = %digest, "wrote image tarball");
                Ok(digest)
            }
        }
    }
}

#[derive(Serialize)]
struct ImageLayout {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: &'static str,
}

#[derive(Serialize)]
struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "mediaType")]
    media_type: &'static str,
    manifests: Vec<Descriptor>,
}

/// Serialize an image as an uncompressed OCI image-layout tar
pub fn layout_tarball(image: &Image, reference: &ImageRef) -> KilnResult<Vec<u8>> {
    let encoded = encode_image(image)?;

    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_REF_NAME.to_string(), reference.reference.clone());
    let index = ImageIndex {
        schema_version: 2,
        media_type: MEDIA_TYPE_OCI_INDEX,
        manifests: vec![Descriptor {
            media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
            digest: sha256_digest(&encoded.manifest),
            size: encoded.manifest.len() as u64,
            annotations: Some(annotations),
        }],
    };

    // Blobs keyed by digest so duplicates collapse and order is stable.
    let mut blobs: BTreeMap<&str, &[u8]> = encoded
        .blobs
        .iter()
        .map(|(digest, bytes)| (digest.as_str(), bytes.as_slice()))
        .collect();
    blobs.insert(&encoded.manifest_digest, &encoded.manifest);

    let mut archive = LayerArchive::new();
    for (digest, bytes) in blobs {
        let hex = digest.trim_start_matches("sha256:");
        archive.append_file(&format!("blobs/sha256/{}", hex), bytes, 0o644)?;
    }
    archive.append_file("index.json", &canonical_json(&index)?, 0o644)?;
    archive.append_file(
        "oci-layout",
        &canonical_json(&ImageLayout {
            image_layout_version: "1.0.0",
        })?,
        0o644,
    )?;
    archive.finish()
}
