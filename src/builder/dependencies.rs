//! Whole-descriptor dependency layer (phase 1)
//!
//! Seeds a scratch tree with the family's descriptor files at the
//! destination, installs the complete dependency set with the family's
//! package manager and packages the destination tree.
//!
//! When the descriptor declares the build hook, dependencies are first
//! installed in development mode so the hook can use its dev tooling. The
//! vendor directory is then cleared and reinstalled production-only.

use super::{
    create_dir, run_checked, scratch_dir, scratch_path, BuildTool, BuilderSettings, LayerBuilder,
    LayerSlot, ToolInvocation,
};
use crate::cache::CacheKey;
use crate::context::BuildContext;
use crate::error::{KilnError, KilnResult};
use crate::family::{RuntimeFamily, BUILD_HOOK};
use crate::layer::{Layer, LayerOverrides};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub struct DependencyBuilder {
    family: RuntimeFamily,
    context: Arc<dyn BuildContext>,
    settings: BuilderSettings,
    slot: LayerSlot,
}

impl DependencyBuilder {
    pub fn new(family: RuntimeFamily, context: Arc<dyn BuildContext>, settings: BuilderSettings) -> Self {
        Self {
            family,
            context,
            settings,
            slot: LayerSlot::new("dependencies"),
        }
    }

    fn install_invocation(&self, scratch: &Path, target: &Path, dev: bool) -> ToolInvocation {
        let program = self.settings.tool_for(self.family);
        let purpose = format!(
            "installing {} {}dependencies",
            self.family,
            if dev { "development " } else { "" }
        );
        let invocation = match self.family {
            RuntimeFamily::Python => ToolInvocation::new(program, target, purpose)
                .args([
                    "-m",
                    "pip",
                    "install",
                    "--disable-pip-version-check",
                    "--no-warn-script-location",
                    "--root",
                ])
                .arg(scratch.to_string_lossy())
                .args(["--prefix", self.settings.destination.as_str()])
                .args(["-r", "requirements.txt"]),
            RuntimeFamily::Node => ToolInvocation::new(program, target, purpose)
                .arg("install")
                .args((!dev).then_some("--production"))
                .args(["--no-audit", "--no-fund"]),
            RuntimeFamily::Php => ToolInvocation::new(program, target, purpose)
                .arg("install")
                .args((!dev).then_some("--no-dev"))
                .args(["--no-scripts", "--no-interaction", "--prefer-dist"]),
        };
        match self.family.dev_env() {
            Some((key, value)) if dev => invocation.env(key, value),
            _ => invocation,
        }
    }

    fn hook_invocation(&self, target: &Path) -> Option<ToolInvocation> {
        let (key, value) = self.family.dev_env()?;
        let program = self.settings.tool_for(self.family);
        Some(
            ToolInvocation::new(program, target, format!("running {} hook", BUILD_HOOK))
                .args(["run-script", BUILD_HOOK])
                .env(key, value),
        )
    }

    async fn run_hook(&self, tool: &dyn BuildTool, target: &Path) -> KilnResult<()> {
        let Some(invocation) = self.hook_invocation(target) else {
            return Ok(());
        };
        info!(hook = BUILD_HOOK, family = %self.family, "running build hook");
        let output = tool.run(&invocation).await?;
        if output.success() {
            Ok(())
        } else {
            Err(KilnError::HookFailed {
                hook: BUILD_HOOK.to_string(),
                code: output.code,
                output: output.tail(),
            })
        }
    }
}

/// Copy descriptors into the scratch destination and clear vendor directories
pub(crate) fn seed_descriptors(
    family: RuntimeFamily,
    context: &dyn BuildContext,
    target: &Path,
) -> KilnResult<()> {
    create_dir(target)?;
    for name in family.present_descriptors(context) {
        let path = target.join(name);
        std::fs::write(&path, context.get_file(name)?)
            .map_err(|e| KilnError::io(format!("writing {}", path.display()), e))?;
    }
    clear_vendor_dirs(family, target)
}

fn clear_vendor_dirs(family: RuntimeFamily, target: &Path) -> KilnResult<()> {
    for vendor in family.vendor_dirs() {
        let dir = target.join(vendor);
        if dir.exists() {
            debug!(dir = %dir.display(), "removing vendor directory");
            std::fs::remove_dir_all(&dir)
                .map_err(|e| KilnError::io(format!("removing {}", dir.display()), e))?;
        }
    }
    Ok(())
}

#[async_trait]
impl LayerBuilder for DependencyBuilder {
    fn name(&self) -> String {
        "dependencies".to_string()
    }

    fn namespace(&self) -> Option<String> {
        Some(self.family.dependency_namespace())
    }

    fn cache_key(&self) -> KilnResult<Option<CacheKey>> {
        CacheKey::descriptors(
            self.family,
            self.context.as_ref(),
            &self.settings.destination,
            &self.settings.cache_version,
        )
        .map(Some)
    }

    async fn build(&mut self, tool: &dyn BuildTool) -> KilnResult<Arc<Layer>> {
        self.slot.start()?;
        let scratch = scratch_dir()?;
        let target = scratch_path(scratch.path(), &self.settings.destination);
        seed_descriptors(self.family, self.context.as_ref(), &target)?;

        if self.family.declares_hook(self.context.as_ref())? {
            info!(family = %self.family, "installing development dependencies for build hook");
            run_checked(tool, &self.install_invocation(scratch.path(), &target, true)).await?;
            self.run_hook(tool, &target).await?;
            clear_vendor_dirs(self.family, &target)?;
        }

        info!(family = %self.family, dest = %self.settings.destination, "installing dependencies");
        run_checked(tool, &self.install_invocation(scratch.path(), &target, false)).await?;

        let layer = Layer::from_directory(scratch.path(), LayerOverrides::default())?;
        debug!(diff_id = %layer.diff_id(), size = layer.size(), "dependency layer built");
        Ok(self.slot.fill(layer))
    }

    fn set_cached(&mut self, layer: Arc<Layer>) -> KilnResult<()> {
        self.slot.fill_cached(layer)
    }

    fn layer(&self) -> KilnResult<Arc<Layer>> {
        self.slot.get()
    }
}
