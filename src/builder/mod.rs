//! Layer builders
//!
//! One builder per build phase. Every builder computes its own cache key,
//! materializes its layer at most once (or accepts one from the cache) and
//! hands the layer out read-only afterwards.
//!
//! | Builder | Phase | Cached |
//! |---------|-------|--------|
//! | [`InterpreterBuilder`] | runtime tree | yes, shared across apps |
//! | [`DependencyBuilder`] | whole descriptor (phase 1) | yes |
//! | [`PackageBuilder`] | single package (phase 2) | yes |
//! | [`AppBuilder`] | application source | never |

mod app;
mod dependencies;
mod interpreter;
mod package;
pub mod tool;

pub use app::AppBuilder;
pub use dependencies::DependencyBuilder;
pub use interpreter::InterpreterBuilder;
pub use package::{can_resolve_packages, resolve_packages, PackageBuilder, PackageSet, PackageSpec};
pub use tool::{run_checked, BuildTool, ProcessTool, ToolInvocation, ToolOutput};

use crate::cache::CacheKey;
use crate::error::{KilnError, KilnResult};
use crate::family::RuntimeFamily;
use crate::layer::Layer;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// PATH used when a layer prepends its own bin directory
pub(crate) const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Common capabilities of every layer builder
#[async_trait]
pub trait LayerBuilder: Send + Sync {
    /// Short name used in logs and image history
    fn name(&self) -> String;

    /// Cache namespace, `None` when the layer is never cached
    fn namespace(&self) -> Option<String>;

    /// Cache key material, `None` disables caching
    fn cache_key(&self) -> KilnResult<Option<CacheKey>>;

    /// Materialize the layer. Fails with [`KilnError::BuilderReused`] when
    /// called a second time.
    async fn build(&mut self, tool: &dyn BuildTool) -> KilnResult<Arc<Layer>>;

    /// Populate the builder from a cache hit instead of building
    fn set_cached(&mut self, layer: Arc<Layer>) -> KilnResult<()>;

    /// The materialized layer. Fails with [`KilnError::UnbuiltLayer`] before
    /// a build or cache hit.
    fn layer(&self) -> KilnResult<Arc<Layer>>;
}

/// Build-once holder for a builder's layer
#[derive(Debug)]
pub(crate) struct LayerSlot {
    name: String,
    layer: Option<Arc<Layer>>,
    started: bool,
}

impl LayerSlot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layer: None,
            started: false,
        }
    }

    /// Mark the build as started; a second start is an error even when the
    /// first attempt failed
    pub fn start(&mut self) -> KilnResult<()> {
        if self.started || self.layer.is_some() {
            return Err(KilnError::BuilderReused(self.name.clone()));
        }
        self.started = true;
        Ok(())
    }

    pub fn fill(&mut self, layer: Layer) -> Arc<Layer> {
        let layer = Arc::new(layer);
        self.layer = Some(Arc::clone(&layer));
        layer
    }

    pub fn fill_cached(&mut self, layer: Arc<Layer>) -> KilnResult<()> {
        if self.started || self.layer.is_some() {
            return Err(KilnError::BuilderReused(self.name.clone()));
        }
        self.layer = Some(layer);
        Ok(())
    }

    pub fn get(&self) -> KilnResult<Arc<Layer>> {
        self.layer
            .clone()
            .ok_or_else(|| KilnError::UnbuiltLayer(self.name.clone()))
    }
}

/// Tool programs and key inputs shared by the cached builders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderSettings {
    /// Where dependency layers land inside the image
    pub destination: String,
    /// Cache key schema version
    pub cache_version: String,
    /// Python interpreter program
    pub python: String,
    /// Python version recorded in the interpreter key
    pub python_version: String,
    pub npm: String,
    pub composer: String,
}

impl BuilderSettings {
    /// Defaults for a family with its default destination
    pub fn for_family(family: RuntimeFamily) -> Self {
        Self {
            destination: family.default_destination().to_string(),
            cache_version: "v1".to_string(),
            python: "python3".to_string(),
            python_version: "3".to_string(),
            npm: "npm".to_string(),
            composer: "composer".to_string(),
        }
    }

    /// Package manager program for a family
    pub fn tool_for(&self, family: RuntimeFamily) -> &str {
        match family {
            RuntimeFamily::Python => &self.python,
            RuntimeFamily::Node => &self.npm,
            RuntimeFamily::Php => &self.composer,
        }
    }
}

/// `root` joined with an absolute in-image path
pub(crate) fn scratch_path(root: &Path, image_path: &str) -> PathBuf {
    root.join(image_path.trim_start_matches('/'))
}

pub(crate) fn create_dir(path: &Path) -> KilnResult<()> {
    std::fs::create_dir_all(path)
        .map_err(|e| KilnError::io(format!("creating {}", path.display()), e))
}

pub(crate) fn scratch_dir() -> KilnResult<tempfile::TempDir> {
    tempfile::Builder::new()
        .prefix("kiln-")
        .tempdir()
        .map_err(|e| KilnError::io("creating scratch directory", e))
}
