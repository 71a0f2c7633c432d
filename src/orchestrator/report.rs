//! Build summary returned by a session

use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// How a layer was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerSource {
    /// Taken from the base image
    Base,
    /// Cache hit
    Cached,
    /// Built during this session
    Built,
}

impl fmt::Display for LayerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base => write!(f, "base"),
            Self::Cached => write!(f, "cached"),
            Self::Built => write!(f, "built"),
        }
    }
}

/// One layer of the final image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerSummary {
    pub name: String,
    pub diff_id: String,
    pub digest: String,
    pub size: u64,
    pub source: LayerSource,
}

/// Outcome of a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub session_id: Uuid,
    /// Manifest digest of the delivered image
    pub digest: String,
    pub layers: Vec<LayerSummary>,
    pub cache_hits: usize,
    pub cache_misses: usize,
    /// Cache entries written
    pub stores: usize,
    /// Layers materialized by running build tools
    pub builds: usize,
}

impl BuildReport {
    pub(crate) fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            digest: String::new(),
            layers: Vec::new(),
            cache_hits: 0,
            cache_misses: 0,
            stores: 0,
            builds: 0,
        }
    }

    /// Layers that did not come from the base image
    pub fn added_layers(&self) -> impl Iterator<Item = &LayerSummary> {
        self.layers.iter().filter(|l| l.source != LayerSource::Base)
    }
}
