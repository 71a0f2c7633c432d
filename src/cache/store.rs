//! Registry-backed layer cache
//!
//! Each entry is a one-layer image pushed to
//! `<cache-repo>/<namespace>:<tag>` where the tag is
//! `hex(sha256(base_digest + " " + checksum))`. The entry's creation time is
//! the image config `created` field and the layer's config overrides travel
//! in the config labels, so entries survive any registry that round-trips
//! the config blob.

use crate::error::{KilnError, KilnResult};
use crate::image::{append, Image};
use crate::layer::{Layer, LayerOverrides};
use crate::registry::{ImageRef, Registry};
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Config label keys used to track cache metadata
pub mod labels {
    /// Marks an image as a kiln cache entry
    pub const KILN_CACHE: &str = "io.kiln.cache";
    /// Cache namespace
    pub const NAMESPACE: &str = "io.kiln.cache.namespace";
    /// Cache key checksum
    pub const CHECKSUM: &str = "io.kiln.cache.checksum";
    /// Digest of the base image the entry was built against
    pub const BASE: &str = "io.kiln.cache.base";
    /// JSON-encoded layer overrides
    pub const OVERRIDES: &str = "io.kiln.cache.overrides";
}

/// Tag addressing a cache entry
pub fn entry_tag(base_digest: &str, checksum: &str) -> String {
    hex::encode(Sha256::digest(format!("{} {}", base_digest, checksum).as_bytes()))
}

/// TTL window from a day count
pub fn ttl_from_days(days: u32) -> Duration {
    Duration::days(i64::from(days))
}

/// A cached layer read back from the registry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Registry tag (see [`entry_tag`])
    pub tag: String,
    pub namespace: String,
    /// Cache key checksum, when the entry records it
    pub checksum: Option<String>,
    /// When the entry was stored
    pub created_at: DateTime<Utc>,
    /// The cached layer with its overrides restored
    pub layer: Arc<Layer>,
}

impl CacheEntry {
    /// Decode an entry from a pulled cache image
    pub fn from_image(namespace: &str, tag: &str, image: &Image) -> KilnResult<Self> {
        let invalid = |reason: String| KilnError::CacheEntryInvalid {
            tag: format!("{}:{}", namespace, tag),
            reason,
        };

        let labels = &image.config().config.labels;
        if labels.get(labels::KILN_CACHE).map(String::as_str) != Some("true") {
            return Err(invalid("missing cache label".to_string()));
        }
        let top = image
            .top_layer()
            .ok_or_else(|| invalid("image has no layers".to_string()))?;
        let overrides: LayerOverrides = match labels.get(labels::OVERRIDES) {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| invalid(format!("unreadable overrides: {}", e)))?,
            None => LayerOverrides::default(),
        };

        Ok(Self {
            tag: tag.to_string(),
            namespace: namespace.to_string(),
            checksum: labels.get(labels::CHECKSUM).cloned(),
            created_at: image.created(),
            layer: Arc::new(top.with_overrides(overrides)),
        })
    }

    /// Whether the entry is older than `ttl` at `now`
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.created_at > ttl
    }

    /// Age in whole days at `now`
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days()
    }
}

/// Cache of built layers stored in a registry repository
#[derive(Clone)]
pub struct CacheStore {
    registry: Arc<dyn Registry>,
    repository: String,
    ttl: Duration,
}

impl CacheStore {
    pub fn new(registry: Arc<dyn Registry>, repository: impl Into<String>, ttl: Duration) -> Self {
        Self {
            registry,
            repository: repository.into(),
            ttl,
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn namespace_repo(&self, namespace: &str) -> String {
        format!("{}/{}", self.repository, namespace)
    }

    fn entry_ref(&self, namespace: &str, tag: &str) -> ImageRef {
        ImageRef::tagged(self.namespace_repo(namespace), tag)
    }

    /// Look up an entry.
    ///
    /// Missing or malformed entries are `Ok(None)`. Registry I/O failures
    /// are returned so the caller can decide how to degrade.
    pub async fn get(
        &self,
        base_digest: &str,
        namespace: &str,
        checksum: &str,
    ) -> KilnResult<Option<CacheEntry>> {
        let tag = entry_tag(base_digest, checksum);
        self.get_tag(namespace, &tag).await
    }

    async fn get_tag(&self, namespace: &str, tag: &str) -> KilnResult<Option<CacheEntry>> {
        let reference = self.entry_ref(namespace, tag);
        let image = match self.registry.pull(&reference).await {
            Ok(image) => image,
            Err(KilnError::ImageNotFound(_)) => {
                debug!(namespace, tag, "cache entry not found");
                return Ok(None);
            }
            Err(
                e @ (KilnError::Json(_)
                | KilnError::DigestMismatch { .. }
                | KilnError::Composition(_)
                | KilnError::CacheEntryInvalid { .. }),
            ) => {
                warn!(namespace, tag, error = %e, "ignoring unreadable cache entry");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match CacheEntry::from_image(namespace, tag, &image) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(namespace, tag, error = %e, "ignoring malformed cache entry");
                Ok(None)
            }
        }
    }

    /// Look up an entry and drop it when it is older than the TTL
    pub async fn get_fresh(
        &self,
        base_digest: &str,
        namespace: &str,
        checksum: &str,
        now: DateTime<Utc>,
    ) -> KilnResult<Option<CacheEntry>> {
        Ok(self
            .get(base_digest, namespace, checksum)
            .await?
            .filter(|entry| {
                let expired = entry.is_expired(self.ttl, now);
                if expired {
                    info!(
                        namespace,
                        tag = %entry.tag,
                        created_at = %entry.created_at,
                        "cache entry expired"
                    );
                }
                !expired
            }))
    }

    /// Store a layer. Returns `false` when a fresh entry already holds the
    /// same layer and nothing was written.
    pub async fn store(
        &self,
        base_digest: &str,
        namespace: &str,
        checksum: &str,
        layer: &Arc<Layer>,
    ) -> KilnResult<bool> {
        self.store_at(base_digest, namespace, checksum, layer, Utc::now())
            .await
    }

    /// Store a layer as if written at `now`
    pub async fn store_at(
        &self,
        base_digest: &str,
        namespace: &str,
        checksum: &str,
        layer: &Arc<Layer>,
        now: DateTime<Utc>,
    ) -> KilnResult<bool> {
        let tag = entry_tag(base_digest, checksum);

        match self.get_tag(namespace, &tag).await {
            Ok(Some(existing))
                if existing.layer.digest() == layer.digest()
                    && existing.layer.overrides() == layer.overrides()
                    && !existing.is_expired(self.ttl, now) =>
            {
                debug!(namespace, tag = %tag, "cache entry already current");
                return Ok(false);
            }
            Ok(_) => {}
            Err(e) => debug!(namespace, tag = %tag, error = %e, "could not check existing entry"),
        }

        let mut labels = BTreeMap::new();
        labels.insert(labels::KILN_CACHE.to_string(), "true".to_string());
        labels.insert(labels::NAMESPACE.to_string(), namespace.to_string());
        labels.insert(labels::CHECKSUM.to_string(), checksum.to_string());
        labels.insert(labels::BASE.to_string(), base_digest.to_string());
        labels.insert(
            labels::OVERRIDES.to_string(),
            serde_json::to_string(layer.overrides())?,
        );

        let created_by = format!("kiln cache {}", namespace);
        let mut image = append(
            &Image::scratch(),
            Arc::clone(layer),
            &LayerOverrides::default(),
            &created_by,
        )
        .with_created(now);
        image.config_mut().config.labels = labels;

        let reference = self.entry_ref(namespace, &tag);
        self.registry.push(&reference, &image).await?;
        info!(namespace, tag = %tag, layer = %layer.digest(), "stored cache entry");
        Ok(true)
    }

    /// Every readable entry in the given namespaces
    pub async fn list(&self, namespaces: &[String]) -> KilnResult<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        for namespace in namespaces {
            let tags = self.registry.tags(&self.namespace_repo(namespace)).await?;
            for tag in tags {
                if let Some(entry) = self.get_tag(namespace, &tag).await? {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    /// Remove one entry
    pub async fn remove(&self, namespace: &str, tag: &str) -> KilnResult<()> {
        debug!(namespace, tag, "removing cache entry");
        self.registry.delete(&self.entry_ref(namespace, tag)).await
    }

    /// Remove entries older than `max_age`, returning what was (or with
    /// `dry_run`, would be) removed
    pub async fn gc(
        &self,
        namespaces: &[String],
        max_age: Duration,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> KilnResult<Vec<CacheEntry>> {
        let expired: Vec<CacheEntry> = self
            .list(namespaces)
            .await?
            .into_iter()
            .filter(|e| e.is_expired(max_age, now))
            .collect();
        if !dry_run {
            for entry in &expired {
                self.remove(&entry.namespace, &entry.tag).await?;
            }
        }
        Ok(expired)
    }

    /// Remove every tag in the given namespaces, readable or not
    pub async fn clear(&self, namespaces: &[String]) -> KilnResult<usize> {
        let mut removed = 0;
        for namespace in namespaces {
            for tag in self.registry.tags(&self.namespace_repo(namespace)).await? {
                self.remove(namespace, &tag).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerArchive;
    use crate::registry::MemoryRegistry;

    const BASE: &str = "sha256:base";

    fn layer(content: &[u8]) -> Arc<Layer> {
        let mut archive = LayerArchive::new();
        archive.append_file("env/lib/site.py", content, 0o644).unwrap();
        let overrides = LayerOverrides {
            env: [("VIRTUAL_ENV".to_string(), "/env".to_string())].into(),
            ..Default::default()
        };
        Arc::new(Layer::from_tar(&archive.finish().unwrap(), overrides).unwrap())
    }

    fn store() -> (Arc<MemoryRegistry>, CacheStore) {
        let registry = Arc::new(MemoryRegistry::new());
        let store = CacheStore::new(registry.clone(), "kiln-cache", ttl_from_days(7));
        (registry, store)
    }

    #[test]
    fn tag_is_deterministic() {
        assert_eq!(entry_tag(BASE, "abc"), entry_tag(BASE, "abc"));
        assert_ne!(entry_tag(BASE, "abc"), entry_tag("sha256:other", "abc"));
        assert_eq!(entry_tag(BASE, "abc").len(), 64);
    }

    #[tokio::test]
    async fn store_then_get_returns_layer() {
        let (_registry, store) = store();
        let l = layer(b"one");

        assert!(store.get(BASE, "python-dependencies", "k1").await.unwrap().is_none());
        assert!(store.store(BASE, "python-dependencies", "k1", &l).await.unwrap());

        let entry = store
            .get(BASE, "python-dependencies", "k1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.layer.digest(), l.digest());
        assert_eq!(entry.layer.diff_id(), l.diff_id());
        assert_eq!(entry.layer.overrides(), l.overrides());
        assert_eq!(entry.checksum.as_deref(), Some("k1"));
    }

    #[tokio::test]
    async fn store_is_idempotent() {
        let (registry, store) = store();
        let l = layer(b"one");

        assert!(store.store(BASE, "ns", "k1", &l).await.unwrap());
        assert!(!store.store(BASE, "ns", "k1", &l).await.unwrap());
        assert_eq!(registry.push_count(), 1);
    }

    #[tokio::test]
    async fn different_content_refreshes_entry() {
        let (registry, store) = store();
        store.store(BASE, "ns", "k1", &layer(b"one")).await.unwrap();
        let two = layer(b"two");
        assert!(store.store(BASE, "ns", "k1", &two).await.unwrap());
        assert_eq!(registry.push_count(), 2);

        let entry = store.get(BASE, "ns", "k1").await.unwrap().unwrap();
        assert_eq!(entry.layer.digest(), two.digest());
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let (_registry, store) = store();
        let now = Utc::now();
        let old = now - Duration::days(8);
        store.store_at(BASE, "ns", "k1", &layer(b"one"), old).await.unwrap();

        assert!(store.get(BASE, "ns", "k1").await.unwrap().is_some());
        assert!(store.get_fresh(BASE, "ns", "k1", now).await.unwrap().is_none());
        assert!(store
            .get_fresh(BASE, "ns", "k1", old + Duration::days(6))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn expired_entry_is_rewritten() {
        let (registry, store) = store();
        let l = layer(b"one");
        let now = Utc::now();
        store.store_at(BASE, "ns", "k1", &l, now - Duration::days(30)).await.unwrap();
        assert!(store.store_at(BASE, "ns", "k1", &l, now).await.unwrap());
        assert_eq!(registry.push_count(), 2);
    }

    #[tokio::test]
    async fn foreign_image_is_a_miss() {
        let (registry, store) = store();
        let tag = entry_tag(BASE, "k1");
        let image = append(&Image::scratch(), layer(b"x"), &LayerOverrides::default(), "x");
        registry
            .push(&ImageRef::tagged("kiln-cache/ns", tag), &image)
            .await
            .unwrap();

        assert!(store.get(BASE, "ns", "k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn registry_failure_is_an_error() {
        let (registry, store) = store();
        registry.set_unavailable(true);
        let err = store.get(BASE, "ns", "k1").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn gc_and_clear() {
        let (_registry, store) = store();
        let now = Utc::now();
        let namespaces = vec!["a".to_string(), "b".to_string()];
        store.store_at(BASE, "a", "old", &layer(b"1"), now - Duration::days(40)).await.unwrap();
        store.store_at(BASE, "b", "new", &layer(b"2"), now).await.unwrap();

        assert_eq!(store.list(&namespaces).await.unwrap().len(), 2);

        let dry = store.gc(&namespaces, Duration::days(30), now, true).await.unwrap();
        assert_eq!(dry.len(), 1);
        assert_eq!(store.list(&namespaces).await.unwrap().len(), 2);

        let removed = store.gc(&namespaces, Duration::days(30), now, false).await.unwrap();
        assert_eq!(removed[0].namespace, "a");
        assert_eq!(store.list(&namespaces).await.unwrap().len(), 1);

        assert_eq!(store.clear(&namespaces).await.unwrap(), 1);
        assert!(store.list(&namespaces).await.unwrap().is_empty());
    }
}
