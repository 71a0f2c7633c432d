//! Layer cache
//!
//! Built layers are stored in a registry repository used as a key/value
//! database. Keys are derived from the inputs that determine a layer's
//! content, so identical inputs always resolve to the same entry.
//!
//! # Entry layout
//!
//! | Part | Value |
//! |------|-------|
//! | Repository | `<cache-repo>/<namespace>` |
//! | Tag | `hex(sha256(base_digest + " " + checksum))` |
//! | Created | image config `created` |
//! | Overrides | config label `io.kiln.cache.overrides` |
//!
//! Expired entries are misses. They are rebuilt and written again.

pub mod key;
pub mod store;

pub use key::CacheKey;
pub use store::{entry_tag, labels, ttl_from_days, CacheEntry, CacheStore};

use crate::family::RuntimeFamily;

/// Every namespace kiln writes to, in a stable order
pub fn known_namespaces() -> Vec<String> {
    RuntimeFamily::all()
        .iter()
        .flat_map(|f| {
            [
                f.interpreter_namespace(),
                f.dependency_namespace(),
                f.package_namespace(),
            ]
        })
        .collect()
}
