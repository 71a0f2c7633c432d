//! In-process registry
//!
//! Keeps blobs, manifests and tags in memory with the same encoding a disk or
//! network registry uses. Counts pushes and can simulate an unreachable
//! registry, which makes it the backing store for pipeline tests.

use crate::error::{KilnError, KilnResult};
use crate::image::Image;
use crate::registry::{decode_image, encode_image, ImageRef, Registry};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    /// digest -> blob bytes
    blobs: HashMap<String, Vec<u8>>,
    /// manifest digest -> manifest bytes
    manifests: HashMap<String, Vec<u8>>,
    /// repository -> tag -> manifest digest
    tags: BTreeMap<String, BTreeMap<String, String>>,
}

/// Registry held entirely in memory
#[derive(Default)]
pub struct MemoryRegistry {
    state: RwLock<State>,
    unavailable: AtomicBool,
    pushes: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a registry error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful pushes since creation
    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> KilnResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(KilnError::Registry("memory registry unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn resolve(state: &State, reference: &ImageRef) -> Option<String> {
        if reference.is_digest() {
            state
                .manifests
                .contains_key(&reference.reference)
                .then(|| reference.reference.clone())
        } else {
            state
                .tags
                .get(&reference.repository)
                .and_then(|tags| tags.get(&reference.reference))
                .cloned()
        }
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn exists(&self, reference: &ImageRef) -> KilnResult<bool> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(Self::resolve(&state, reference).is_some())
    }

    async fn pull(&self, reference: &ImageRef) -> KilnResult<Image> {
        self.check_available()?;
        let state = self.state.read().await;
        let manifest = Self::resolve(&state, reference)
            .and_then(|digest| state.manifests.get(&digest))
            .ok_or_else(|| KilnError::ImageNotFound(reference.to_string()))?;
        decode_image(manifest, |digest| {
            state
                .blobs
                .get(digest)
                .cloned()
                .ok_or_else(|| KilnError::Registry(format!("blob {} missing", digest)))
        })
    }

    async fn push(&self, reference: &ImageRef, image: &Image) -> KilnResult<String> {
        self.check_available()?;
        let encoded = encode_image(image)?;
        let digest = encoded.manifest_digest;
        let mut state = self.state.write().await;
        for (blob_digest, bytes) in encoded.blobs {
            state.blobs.entry(blob_digest).or_insert(bytes);
        }
        state.manifests.insert(digest.clone(), encoded.manifest);
        if !reference.is_digest() {
            state
                .tags
                .entry(reference.repository.clone())
                .or_default()
                .insert(reference.reference.clone(), digest.clone());
        }
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(digest)
    }

    async fn tags(&self, repository: &str) -> KilnResult<BTreeSet<String>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .tags
            .get(repository)
            .map(|tags| tags.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, reference: &ImageRef) -> KilnResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if let Some(tags) = state.tags.get_mut(&reference.repository) {
            tags.remove(&reference.reference);
        }
        Ok(())
    }

    fn registry_name(&self) -> &'static str {
        "memory"
    }
}
