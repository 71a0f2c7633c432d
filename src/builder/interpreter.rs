//! Runtime layer: a Python virtual environment at the dependency destination
//!
//! The venv is created under a scratch directory, so the scratch path that
//! venv writes into `bin/activate*`, script shebangs and `pyvenv.cfg` is
//! rewritten to the destination before packaging. `pyvenv.cfg`'s `home` still
//! names the build host's interpreter directory; the base image must provide
//! the interpreter at that path.

use super::{create_dir, run_checked, scratch_dir, scratch_path, BuildTool, BuilderSettings, LayerBuilder, LayerSlot, ToolInvocation, DEFAULT_PATH};
use crate::cache::CacheKey;
use crate::error::{KilnError, KilnResult};
use crate::family::RuntimeFamily;
use crate::layer::{Layer, LayerOverrides};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Builds the interpreter layer shared by every application on a runtime
pub struct InterpreterBuilder {
    family: RuntimeFamily,
    settings: BuilderSettings,
    slot: LayerSlot,
}

impl InterpreterBuilder {
    pub fn new(family: RuntimeFamily, settings: BuilderSettings) -> Self {
        Self {
            family,
            settings,
            slot: LayerSlot::new("interpreter"),
        }
    }

    fn overrides(&self) -> LayerOverrides {
        let dest = &self.settings.destination;
        let mut overrides = LayerOverrides::default();
        overrides.env.insert("VIRTUAL_ENV".to_string(), dest.clone());
        overrides
            .env
            .insert("PATH".to_string(), format!("{}/bin:{}", dest, DEFAULT_PATH));
        overrides
    }
}

#[async_trait]
impl LayerBuilder for InterpreterBuilder {
    fn name(&self) -> String {
        "interpreter".to_string()
    }

    fn namespace(&self) -> Option<String> {
        Some(self.family.interpreter_namespace())
    }

    fn cache_key(&self) -> KilnResult<Option<CacheKey>> {
        Ok(Some(CacheKey::interpreter(
            &self.family.to_string(),
            &self.settings.python_version,
            &self.settings.python,
            &self.settings.cache_version,
        )))
    }

    async fn build(&mut self, tool: &dyn BuildTool) -> KilnResult<Arc<Layer>> {
        self.slot.start()?;
        let scratch = scratch_dir()?;
        let target = scratch_path(scratch.path(), &self.settings.destination);
        if let Some(parent) = target.parent() {
            create_dir(parent)?;
        }

        info!(interpreter = %self.settings.python, dest = %self.settings.destination, "building interpreter layer");
        let invocation = ToolInvocation::new(&self.settings.python, scratch.path(), "creating virtualenv")
            .args(["-m", "venv", "--copies", "--without-pip"])
            .arg(target.to_string_lossy());
        run_checked(tool, &invocation).await?;
        relocate(&target, &target.to_string_lossy(), &self.settings.destination)?;

        let layer = Layer::from_directory(scratch.path(), self.overrides())?;
        Ok(self.slot.fill(layer))
    }

    fn set_cached(&mut self, layer: Arc<Layer>) -> KilnResult<()> {
        self.slot.fill_cached(layer)
    }

    fn layer(&self) -> KilnResult<Arc<Layer>> {
        self.slot.get()
    }
}

/// Replace every occurrence of `from` with `to` in the regular files under `root`
fn relocate(root: &Path, from: &str, to: &str) -> KilnResult<()> {
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.map_err(|e| KilnError::Internal(format!("walking {}: {}", root.display(), e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let bytes = std::fs::read(path).map_err(|e| KilnError::io(format!("reading {}", path.display()), e))?;
        if let Some(rewritten) = replace_all(&bytes, from.as_bytes(), to.as_bytes()) {
            debug!(file = %path.display(), "rewriting scratch prefix");
            std::fs::write(path, rewritten)
                .map_err(|e| KilnError::io(format!("writing {}", path.display()), e))?;
        }
    }
    Ok(())
}

/// `None` when `needle` does not occur
fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Option<Vec<u8>> {
    if needle.is_empty() || !haystack.windows(needle.len()).any(|w| w == needle) {
        return None;
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while !rest.is_empty() {
        if rest.starts_with(needle) {
            out.extend_from_slice(replacement);
            rest = &rest[needle.len()..];
        } else {
            out.push(rest[0]);
            rest = &rest[1..];
        }
    }
    Some(out)
}
