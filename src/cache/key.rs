//! Cache key derivation
//!
//! A cache key is the sorted-key JSON encoding of the inputs that determine a
//! layer's content. Its checksum (hex sha256 of that string) addresses the
//! cache entry. Identical inputs yield identical keys across runs.

use crate::context::BuildContext;
use crate::error::KilnResult;
use crate::family::RuntimeFamily;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fmt;

/// Canonical key material for one cacheable layer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    raw: String,
}

impl CacheKey {
    fn from_value(value: serde_json::Value) -> Self {
        // serde_json objects are BTreeMaps, so keys serialize sorted.
        Self {
            raw: value.to_string(),
        }
    }

    /// Key for a runtime installation shared by every application
    pub fn interpreter(runtime: &str, runtime_version: &str, tool: &str, version: &str) -> Self {
        Self::from_value(json!({
            "runtime": runtime,
            "runtime_version": runtime_version,
            "tool": tool,
            "version": version,
        }))
    }

    /// Key for a whole-descriptor dependency layer. Each present descriptor
    /// contributes its file name and the sha256 of its raw bytes.
    pub fn descriptors(
        family: RuntimeFamily,
        context: &dyn BuildContext,
        destination: &str,
        version: &str,
    ) -> KilnResult<Self> {
        let mut descriptors = serde_json::Map::new();
        for name in family.present_descriptors(context) {
            let bytes = context.get_file(name)?;
            descriptors.insert(name.to_string(), hex::encode(Sha256::digest(&bytes)).into());
        }
        Ok(Self::from_value(json!({
            "descriptors": descriptors,
            "destination": destination,
            "version": version,
        })))
    }

    /// Key for a single package layer
    pub fn package(
        name: &str,
        package_version: &str,
        destination: &str,
        upstream: Option<&CacheKey>,
        version: &str,
    ) -> Self {
        Self::from_value(json!({
            "package": name,
            "package_version": package_version,
            "destination": destination,
            "upstream": upstream.map(|k| k.raw()).unwrap_or(""),
            "version": version,
        }))
    }

    /// The canonical string
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Hex sha256 of the canonical string
    pub fn checksum(&self) -> String {
        hex::encode(Sha256::digest(self.raw.as_bytes()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.checksum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DirectoryContext;
    use std::fs;
    use tempfile::TempDir;

    fn python_context(requirements: &str) -> (TempDir, DirectoryContext) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("requirements.txt"), requirements).unwrap();
        let ctx = DirectoryContext::open(dir.path()).unwrap();
        (dir, ctx)
    }

    #[test]
    fn raw_key_has_sorted_fields() {
        let key = CacheKey::interpreter("python", "3.11", "python3", "v1");
        assert_eq!(
            key.raw(),
            r#"{"runtime":"python","runtime_version":"3.11","tool":"python3","version":"v1"}"#
        );
        assert_eq!(key.checksum().len(), 64);
    }

    #[test]
    fn descriptor_key_is_deterministic() {
        let (_dir, ctx) = python_context("flask==0.12.0\n");
        let a = CacheKey::descriptors(RuntimeFamily::Python, &ctx, "/env", "v1").unwrap();
        let b = CacheKey::descriptors(RuntimeFamily::Python, &ctx, "/env", "v1").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn descriptor_key_changes_with_inputs() {
        let (_dir, ctx) = python_context("flask==0.12.0\n");
        let (_dir2, ctx2) = python_context("flask==1.0.0\n");
        let base = CacheKey::descriptors(RuntimeFamily::Python, &ctx, "/env", "v1").unwrap();

        let content = CacheKey::descriptors(RuntimeFamily::Python, &ctx2, "/env", "v1").unwrap();
        let dest = CacheKey::descriptors(RuntimeFamily::Python, &ctx, "/venv", "v1").unwrap();
        let version = CacheKey::descriptors(RuntimeFamily::Python, &ctx, "/env", "v2").unwrap();

        assert_ne!(base.checksum(), content.checksum());
        assert_ne!(base.checksum(), dest.checksum());
        assert_ne!(base.checksum(), version.checksum());
    }

    #[test]
    fn descriptor_key_hashes_raw_bytes() {
        let write = |bytes: &[u8]| {
            let dir = TempDir::new().unwrap();
            fs::write(dir.path().join("requirements.txt"), bytes).unwrap();
            let ctx = DirectoryContext::open(dir.path()).unwrap();
            (dir, ctx)
        };
        let (_a, ctx_a) = write(b"flask==0.12.0\n# \xff\n");
        let (_b, ctx_b) = write(b"flask==0.12.0\n# \xfe\n");

        let a = CacheKey::descriptors(RuntimeFamily::Python, &ctx_a, "/env", "v1").unwrap();
        let b = CacheKey::descriptors(RuntimeFamily::Python, &ctx_b, "/env", "v1").unwrap();
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn descriptor_key_includes_file_names() {
        let node = |name: &str| {
            let dir = TempDir::new().unwrap();
            fs::write(dir.path().join(name), "{}").unwrap();
            let ctx = DirectoryContext::open(dir.path()).unwrap();
            (dir, ctx)
        };
        let (_a, manifest_only) = node("package.json");
        let (_b, lock_only) = node("package-lock.json");

        let a = CacheKey::descriptors(RuntimeFamily::Node, &manifest_only, "/srv", "v1").unwrap();
        let b = CacheKey::descriptors(RuntimeFamily::Node, &lock_only, "/srv", "v1").unwrap();
        assert_ne!(a.checksum(), b.checksum());
        assert!(a.raw().contains(r#""package.json":"#));
    }

    #[test]
    fn package_key_depends_on_upstream() {
        let py311 = CacheKey::interpreter("python", "3.11", "python3", "v1");
        let py312 = CacheKey::interpreter("python", "3.12", "python3", "v1");

        let a = CacheKey::package("flask", "0.12.0", "/env", Some(&py311), "v1");
        let b = CacheKey::package("flask", "0.12.0", "/env", Some(&py312), "v1");
        let c = CacheKey::package("flask", "0.12.0", "/env", None, "v1");

        assert_ne!(a.checksum(), b.checksum());
        assert_ne!(a.checksum(), c.checksum());
        assert!(c.raw().contains(r#""upstream":"""#));
    }
}
