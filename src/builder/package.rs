//! Single-package dependency layers (phase 2)
//!
//! Each package of the resolved set gets its own scratch tree and its own
//! cache entry. Packages are installed without re-resolving transitive
//! dependencies: the resolved set already lists them.

use super::{
    create_dir, run_checked, scratch_dir, scratch_path, BuildTool, BuilderSettings, LayerBuilder,
    LayerSlot, ToolInvocation,
};
use crate::cache::CacheKey;
use crate::context::BuildContext;
use crate::error::{KilnError, KilnResult};
use crate::family::RuntimeFamily;
use crate::layer::{Layer, LayerOverrides};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info};

/// One resolved package
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageSpec {
    pub name: String,
    pub version: String,
    /// Install location relative to the destination. Empty for Python,
    /// `node_modules/<name>` (possibly nested) for Node.
    pub location: String,
    /// File produced during resolution, installed instead of fetching by name
    pub artifact: Option<PathBuf>,
}

impl PackageSpec {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            location: String::new(),
            artifact: None,
        }
    }
}

/// A resolved package set. Artifacts referenced by the packages live in the
/// resolution directory, which is removed when the set is dropped.
#[derive(Debug)]
pub struct PackageSet {
    pub packages: Vec<PackageSpec>,
    _work: Option<TempDir>,
}

/// Builds the layer for exactly one package
pub struct PackageBuilder {
    family: RuntimeFamily,
    package: PackageSpec,
    upstream: Option<CacheKey>,
    settings: BuilderSettings,
    slot: LayerSlot,
}

impl PackageBuilder {
    /// `upstream` is the interpreter layer's key, if any; changing the
    /// runtime invalidates every package entry.
    pub fn new(
        family: RuntimeFamily,
        package: PackageSpec,
        upstream: Option<CacheKey>,
        settings: BuilderSettings,
    ) -> Self {
        let slot = LayerSlot::new(format!("{}=={}", package.name, package.version));
        Self {
            family,
            package,
            upstream,
            settings,
            slot,
        }
    }

    pub fn package(&self) -> &PackageSpec {
        &self.package
    }

    fn install_destination(&self) -> String {
        if self.package.location.is_empty() {
            self.settings.destination.clone()
        } else {
            format!(
                "{}/{}",
                self.settings.destination.trim_end_matches('/'),
                self.package.location
            )
        }
    }

    async fn install_python(&self, tool: &dyn BuildTool, scratch: &Path) -> KilnResult<()> {
        let invocation = ToolInvocation::new(
            &self.settings.python,
            scratch,
            format!("installing {}=={}", self.package.name, self.package.version),
        )
        .args([
            "-m",
            "pip",
            "install",
            "--no-deps",
            "--disable-pip-version-check",
            "--no-warn-script-location",
            "--root",
        ])
        .arg(scratch.to_string_lossy())
        .args(["--prefix", self.settings.destination.as_str()]);
        let invocation = match &self.package.artifact {
            Some(wheel) => invocation.arg("--no-index").arg(wheel.to_string_lossy()),
            None => invocation.arg(format!("{}=={}", self.package.name, self.package.version)),
        };
        run_checked(tool, &invocation).await.map(|_| ())
    }

    async fn install_node(&self, tool: &dyn BuildTool, scratch: &Path) -> KilnResult<()> {
        // npm has no --no-deps; fetch the package tarball and unpack it in place.
        let work = scratch_dir()?;
        let invocation = ToolInvocation::new(
            &self.settings.npm,
            work.path(),
            format!("fetching {}@{}", self.package.name, self.package.version),
        )
        .args(["pack", "--silent"])
        .arg(format!("{}@{}", self.package.name, self.package.version))
        .arg("--pack-destination")
        .arg(work.path().to_string_lossy());
        run_checked(tool, &invocation).await?;

        let tarball = find_tarball(work.path())?;
        let target = scratch_path(scratch, &self.install_destination());
        unpack_npm_tarball(&tarball, &target)
    }
}

#[async_trait]
impl LayerBuilder for PackageBuilder {
    fn name(&self) -> String {
        format!("{}=={}", self.package.name, self.package.version)
    }

    fn namespace(&self) -> Option<String> {
        Some(self.family.package_namespace())
    }

    fn cache_key(&self) -> KilnResult<Option<CacheKey>> {
        Ok(Some(CacheKey::package(
            &self.package.name,
            &self.package.version,
            &self.install_destination(),
            self.upstream.as_ref(),
            &self.settings.cache_version,
        )))
    }

    async fn build(&mut self, tool: &dyn BuildTool) -> KilnResult<Arc<Layer>> {
        self.slot.start()?;
        let scratch = scratch_dir()?;
        debug!(package = %self.package.name, version = %self.package.version, "building package layer");

        match self.family {
            RuntimeFamily::Python => self.install_python(tool, scratch.path()).await?,
            RuntimeFamily::Node => self.install_node(tool, scratch.path()).await?,
            RuntimeFamily::Php => {
                return Err(KilnError::Internal(
                    "per-package builds are not supported for php".to_string(),
                ))
            }
        }

        let layer = Layer::from_directory(scratch.path(), LayerOverrides::default())?;
        Ok(self.slot.fill(layer))
    }

    fn set_cached(&mut self, layer: Arc<Layer>) -> KilnResult<()> {
        self.slot.fill_cached(layer)
    }

    fn layer(&self) -> KilnResult<Arc<Layer>> {
        self.slot.get()
    }
}

fn find_tarball(dir: &Path) -> KilnResult<std::path::PathBuf> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| KilnError::io(format!("listing {}", dir.display()), e))?;
    let mut tarballs: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "tgz"))
        .collect();
    tarballs.sort();
    tarballs
        .into_iter()
        .next()
        .ok_or_else(|| KilnError::Internal(format!("npm pack produced no tarball in {}", dir.display())))
}

/// Unpack an npm package tarball, dropping its leading `package/` directory
pub(crate) fn unpack_npm_tarball(tarball: &Path, target: &Path) -> KilnResult<()> {
    let file = std::fs::File::open(tarball)
        .map_err(|e| KilnError::io(format!("opening {}", tarball.display()), e))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    create_dir(target)?;

    let entries = archive
        .entries()
        .map_err(|e| KilnError::io(format!("reading {}", tarball.display()), e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| KilnError::io("reading tarball entry", e))?;
        let path = entry
            .path()
            .map_err(|e| KilnError::io("reading tarball path", e))?
            .into_owned();
        let stripped: std::path::PathBuf = path.components().skip(1).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        if stripped
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(KilnError::Internal(format!(
                "refusing to unpack {} outside the package",
                path.display()
            )));
        }
        let dest = target.join(&stripped);
        if let Some(parent) = dest.parent() {
            create_dir(parent)?;
        }
        entry
            .unpack(&dest)
            .map_err(|e| KilnError::io(format!("unpacking {}", dest.display()), e))?;
    }
    Ok(())
}

/// Whether phase 2 can enumerate packages for this context
pub fn can_resolve_packages(family: RuntimeFamily, context: &dyn BuildContext) -> bool {
    match family {
        RuntimeFamily::Python => context.contains("requirements.txt"),
        RuntimeFamily::Node => context.contains("package-lock.json"),
        RuntimeFamily::Php => false,
    }
}

/// Enumerate the full package set, sorted by name then location.
///
/// Python asks pip to build wheels for the whole requirement set and reads
/// the resulting file names. The wheels stay in the returned set and are what
/// each package layer installs. Node reads package-lock.json directly.
pub async fn resolve_packages(
    family: RuntimeFamily,
    context: &dyn BuildContext,
    settings: &BuilderSettings,
    tool: &dyn BuildTool,
) -> KilnResult<PackageSet> {
    let (mut packages, work) = match family {
        RuntimeFamily::Python => {
            let (packages, work) = resolve_python(context, settings, tool).await?;
            (packages, Some(work))
        }
        RuntimeFamily::Node => (parse_package_lock(&context.get_file("package-lock.json")?)?, None),
        RuntimeFamily::Php => {
            return Err(KilnError::Internal(
                "per-package builds are not supported for php".to_string(),
            ))
        }
    };
    packages.sort();
    packages.dedup();
    info!(family = %family, count = packages.len(), "resolved package set");
    Ok(PackageSet {
        packages,
        _work: work,
    })
}

async fn resolve_python(
    context: &dyn BuildContext,
    settings: &BuilderSettings,
    tool: &dyn BuildTool,
) -> KilnResult<(Vec<PackageSpec>, TempDir)> {
    let work = scratch_dir()?;
    let requirements = work.path().join("requirements.txt");
    std::fs::write(&requirements, context.get_file("requirements.txt")?)
        .map_err(|e| KilnError::io(format!("writing {}", requirements.display()), e))?;
    let wheels = work.path().join("wheels");
    create_dir(&wheels)?;

    let invocation = ToolInvocation::new(&settings.python, work.path(), "resolving requirements")
        .args(["-m", "pip", "wheel", "--disable-pip-version-check", "-w"])
        .arg(wheels.to_string_lossy())
        .args(["-r", "requirements.txt"]);
    run_checked(tool, &invocation).await?;

    let entries = std::fs::read_dir(&wheels)
        .map_err(|e| KilnError::io(format!("listing {}", wheels.display()), e))?;
    let mut packages = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| KilnError::io(format!("listing {}", wheels.display()), e))?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        match parse_wheel_name(&file_name) {
            Some(spec) => packages.push(PackageSpec {
                artifact: Some(entry.path()),
                ..spec
            }),
            None => debug!(file = %file_name, "skipping non-wheel file"),
        }
    }
    Ok((packages, work))
}

/// Parse `{name}-{version}(-{build})?-{python}-{abi}-{platform}.whl`
pub(crate) fn parse_wheel_name(file_name: &str) -> Option<PackageSpec> {
    let stem = file_name.strip_suffix(".whl")?;
    let mut parts = stem.split('-');
    let name = parts.next().filter(|n| !n.is_empty())?;
    let version = parts.next().filter(|v| !v.is_empty())?;
    // python, abi and platform tags must follow
    if parts.count() < 3 {
        return None;
    }
    Some(PackageSpec::new(
        name.to_ascii_lowercase().replace('_', "-"),
        version,
    ))
}

#[derive(Deserialize)]
struct PackageLock {
    #[serde(default)]
    packages: BTreeMap<String, LockEntry>,
    #[serde(default)]
    dependencies: BTreeMap<String, LockEntry>,
}

#[derive(Deserialize)]
struct LockEntry {
    version: Option<String>,
    #[serde(default)]
    dev: bool,
    #[serde(default)]
    link: bool,
}

/// Production packages from a package-lock.json (lockfile v1, v2 or v3)
pub(crate) fn parse_package_lock(bytes: &[u8]) -> KilnResult<Vec<PackageSpec>> {
    let lock: PackageLock = serde_json::from_slice(bytes).map_err(|e| KilnError::DescriptorInvalid {
        path: "package-lock.json".to_string(),
        reason: e.to_string(),
    })?;

    let mut packages = Vec::new();
    if !lock.packages.is_empty() {
        for (location, entry) in &lock.packages {
            // "" is the root project
            let Some((_, name)) = location.rsplit_once("node_modules/") else {
                continue;
            };
            if entry.dev || entry.link {
                continue;
            }
            let Some(version) = &entry.version else {
                continue;
            };
            packages.push(PackageSpec {
                name: name.to_string(),
                version: version.clone(),
                location: location.clone(),
                artifact: None,
            });
        }
    } else {
        for (name, entry) in &lock.dependencies {
            if entry.dev {
                continue;
            }
            if let Some(version) = &entry.version {
                packages.push(PackageSpec {
                    name: name.clone(),
                    version: version.clone(),
                    location: format!("node_modules/{}", name),
                    artifact: None,
                });
            }
        }
    }
    Ok(packages)
}
