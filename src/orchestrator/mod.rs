//! Build orchestration
//!
//! A [`BuildSession`] drives one build end to end:
//!
//! 1. Resolve the runtime family from the context's descriptors
//! 2. Interpreter layer, when the family has one
//! 3. Phase-1 lookup of the whole-descriptor layer
//! 4. On a miss, per-package layers (phase 2) or a whole-descriptor build
//! 5. Store freshly built layers once every layer exists
//! 6. Compose base, interpreter, dependencies and app in that order
//! 7. Deliver to the output sink
//!
//! Cache failures degrade to misses. Tool failures abort the build before
//! anything is stored or delivered.

mod parallel;
mod report;

pub use report::{BuildReport, LayerSource, LayerSummary};

use crate::builder::{
    can_resolve_packages, resolve_packages, AppBuilder, BuildTool, BuilderSettings,
    DependencyBuilder, InterpreterBuilder, LayerBuilder,
};
use crate::cache::{CacheStore, CacheKey};
use crate::context::{BuildContext, DirectoryContext};
use crate::error::KilnResult;
use crate::family::RuntimeFamily;
use crate::image::{compose, Image, OutputSink};
use crate::layer::{Layer, LayerOverrides};
use crate::registry::{ImageRef, Registry};
use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Base reference that means "no base image"
pub const SCRATCH: &str = "scratch";

/// Where the finished image goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Push to the registry under the target reference
    Push,
    /// Write an OCI layout tarball
    Tarball(PathBuf),
}

/// Everything a build needs to know, resolved from config and flags
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub base_image: String,
    pub target: ImageRef,
    pub context_path: PathBuf,
    /// Forced runtime family; detected from descriptors when unset
    pub runtime: Option<RuntimeFamily>,
    pub cache_enabled: bool,
    pub global_cache: bool,
    /// Cache dependencies one package at a time where supported
    pub per_package: bool,
    /// Cache repository for per-target caches; `<target>/cache` when unset
    pub cache_repository: Option<String>,
    pub global_repository: String,
    pub cache_version: String,
    pub ttl: Duration,
    pub output: OutputTarget,
    /// Dependency destination; the family default when unset
    pub destination: Option<String>,
    pub app_destination: String,
    pub entrypoint: Option<Vec<String>>,
    pub exposed_ports: Option<Vec<String>>,
    /// Phase-2 worker count
    pub jobs: usize,
    pub python: String,
    pub python_version: String,
    pub npm: String,
    pub composer: String,
    /// Creation time written to the final config
    pub created: DateTime<Utc>,
}

impl BuildOptions {
    /// Defaults for building `context_path` into `target`
    pub fn new(target: ImageRef, context_path: impl Into<PathBuf>) -> Self {
        Self {
            base_image: SCRATCH.to_string(),
            target,
            context_path: context_path.into(),
            runtime: None,
            cache_enabled: true,
            global_cache: false,
            per_package: false,
            cache_repository: None,
            global_repository: "kiln-global-cache".to_string(),
            cache_version: "v1".to_string(),
            ttl: Duration::days(7),
            output: OutputTarget::Push,
            destination: None,
            app_destination: "/srv".to_string(),
            entrypoint: None,
            exposed_ports: None,
            jobs: 4,
            python: "python3".to_string(),
            python_version: "3".to_string(),
            npm: "npm".to_string(),
            composer: "composer".to_string(),
            created: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// Repository holding this build's cache entries
    pub fn cache_repository(&self) -> String {
        if self.global_cache {
            self.global_repository.clone()
        } else {
            self.cache_repository
                .clone()
                .unwrap_or_else(|| format!("{}/cache", self.target.repository))
        }
    }

    fn settings(&self, family: RuntimeFamily) -> BuilderSettings {
        BuilderSettings {
            destination: self
                .destination
                .clone()
                .unwrap_or_else(|| family.default_destination().to_string()),
            cache_version: self.cache_version.clone(),
            python: self.python.clone(),
            python_version: self.python_version.clone(),
            npm: self.npm.clone(),
            composer: self.composer.clone(),
        }
    }
}

/// A cache write deferred until every layer of the build exists
#[derive(Debug, Clone)]
pub(crate) struct PendingStore {
    namespace: String,
    checksum: String,
    layer: Arc<Layer>,
}

/// A layer ready for composition
#[derive(Debug, Clone)]
pub(crate) struct Resolved {
    name: String,
    layer: Arc<Layer>,
    source: LayerSource,
    /// Whether a build tool ran to produce it
    installed: bool,
    pending: Option<PendingStore>,
}

/// Namespace and checksum of a cacheable builder
struct CacheSlot {
    namespace: String,
    checksum: String,
}

fn cache_slot(cache: Option<&CacheStore>, builder: &dyn LayerBuilder) -> KilnResult<Option<CacheSlot>> {
    if cache.is_none() {
        return Ok(None);
    }
    Ok(match (builder.namespace(), builder.cache_key()?) {
        (Some(namespace), Some(key)) => Some(CacheSlot {
            namespace,
            checksum: key.checksum(),
        }),
        _ => None,
    })
}

/// Cache lookup that never fails the build on registry trouble
async fn lookup(
    cache: Option<&CacheStore>,
    slot: Option<&CacheSlot>,
    base_digest: &str,
    builder: &mut dyn LayerBuilder,
) -> KilnResult<Option<Arc<Layer>>> {
    let (Some(cache), Some(slot)) = (cache, slot) else {
        return Ok(None);
    };
    match cache
        .get_fresh(base_digest, &slot.namespace, &slot.checksum, Utc::now())
        .await
    {
        Ok(Some(entry)) => {
            info!(layer = %builder.name(), namespace = %slot.namespace, "cache hit");
            builder.set_cached(Arc::clone(&entry.layer))?;
            Ok(Some(entry.layer))
        }
        Ok(None) => {
            info!(layer = %builder.name(), namespace = %slot.namespace, "cache miss");
            Ok(None)
        }
        Err(e) => {
            warn!(layer = %builder.name(), error = %e, "cache lookup failed, treating as miss");
            Ok(None)
        }
    }
}

async fn build_layer(
    tool: &dyn BuildTool,
    builder: &mut dyn LayerBuilder,
    slot: Option<CacheSlot>,
) -> KilnResult<Resolved> {
    let layer = builder.build(tool).await?;
    Ok(Resolved {
        name: builder.name(),
        layer: Arc::clone(&layer),
        source: LayerSource::Built,
        installed: true,
        pending: slot.map(|s| PendingStore {
            namespace: s.namespace,
            checksum: s.checksum,
            layer,
        }),
    })
}

/// Lookup, then build on a miss
pub(crate) async fn resolve_layer(
    cache: Option<&CacheStore>,
    tool: &dyn BuildTool,
    builder: &mut dyn LayerBuilder,
    base_digest: &str,
) -> KilnResult<Resolved> {
    let slot = cache_slot(cache, builder)?;
    if let Some(layer) = lookup(cache, slot.as_ref(), base_digest, builder).await? {
        return Ok(Resolved {
            name: builder.name(),
            layer,
            source: LayerSource::Cached,
            installed: false,
            pending: None,
        });
    }
    build_layer(tool, builder, slot).await
}

/// Receives pipeline progress as layers become available
pub trait BuildObserver: Send + Sync {
    /// A pipeline step is starting
    fn phase(&self, _message: &str) {}

    /// A layer was taken from the cache or built
    fn layer_ready(&self, _name: &str, _source: LayerSource) {}
}

/// Per-invocation context passed to every pipeline step
pub struct BuildSession {
    id: Uuid,
    options: BuildOptions,
    registry: Arc<dyn Registry>,
    cache: Option<CacheStore>,
    tool: Arc<dyn BuildTool>,
    context: Arc<dyn BuildContext>,
    observer: Option<Arc<dyn BuildObserver>>,
}

impl BuildSession {
    pub fn new(
        options: BuildOptions,
        registry: Arc<dyn Registry>,
        tool: Arc<dyn BuildTool>,
    ) -> KilnResult<Self> {
        let context: Arc<dyn BuildContext> = Arc::new(DirectoryContext::open(&options.context_path)?);
        let cache = options.cache_enabled.then(|| {
            CacheStore::new(Arc::clone(&registry), options.cache_repository(), options.ttl)
        });
        Ok(Self {
            id: Uuid::new_v4(),
            options,
            registry,
            cache,
            tool,
            context,
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn BuildObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    fn phase(&self, message: &str) {
        if let Some(observer) = &self.observer {
            observer.phase(message);
        }
    }

    fn ready(&self, resolved: Resolved, into: &mut Vec<Resolved>) {
        if let Some(observer) = &self.observer {
            observer.layer_ready(&resolved.name, resolved.source);
        }
        into.push(resolved);
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn cache(&self) -> Option<&CacheStore> {
        self.cache.as_ref()
    }

    /// Run the whole pipeline and deliver the image
    pub async fn run(&self) -> KilnResult<BuildReport> {
        let mut report = BuildReport::new(self.id);
        let base = self.base_image().await?;
        let base_digest = base.digest()?;
        info!(
            session = %self.id,
            base = %self.options.base_image,
            base_digest = %base_digest,
            target = %self.options.target,
            "starting build"
        );

        let mut resolved = Vec::new();
        let family = self.family();
        match family {
            Some(family) => {
                self.dependency_layers(family, &base_digest, &mut resolved).await?
            }
            None => info!("no dependency descriptors found, skipping dependency layers"),
        }
        self.phase("packaging application");
        let app = self.app_layer(family).await?;
        self.ready(app, &mut resolved);

        self.store_pending(&base_digest, &resolved, &mut report).await;

        let image = compose(&base, resolved.iter().map(|r| (r.name.as_str(), &r.layer)))
            .with_created(self.options.created);

        for layer in base.layers() {
            report.layers.push(summary("base", layer, LayerSource::Base));
        }
        for r in &resolved {
            report.layers.push(summary(&r.name, &r.layer, r.source));
            match r.source {
                LayerSource::Cached => report.cache_hits += 1,
                LayerSource::Built if r.pending.is_some() => report.cache_misses += 1,
                _ => {}
            }
            if r.installed {
                report.builds += 1;
            }
        }

        self.phase("writing image");
        report.digest = self.sink().deliver(&image).await?;
        info!(
            session = %self.id,
            digest = %report.digest,
            hits = report.cache_hits,
            misses = report.cache_misses,
            stores = report.stores,
            "build complete"
        );
        Ok(report)
    }

    async fn base_image(&self) -> KilnResult<Image> {
        if self.options.base_image == SCRATCH {
            return Ok(Image::scratch());
        }
        let reference = ImageRef::parse(&self.options.base_image)?;
        self.registry.pull(&reference).await
    }

    fn family(&self) -> Option<RuntimeFamily> {
        self.options
            .runtime
            .or_else(|| RuntimeFamily::detect(self.context.as_ref()))
            .filter(|f| !f.present_descriptors(self.context.as_ref()).is_empty())
    }

    async fn dependency_layers(
        &self,
        family: RuntimeFamily,
        base_digest: &str,
        resolved: &mut Vec<Resolved>,
    ) -> KilnResult<()> {
        let settings = self.options.settings(family);
        let cache = self.cache.as_ref();
        let tool = self.tool.as_ref();

        let mut upstream: Option<CacheKey> = None;
        if family.has_interpreter() {
            self.phase("preparing interpreter");
            let mut interpreter = InterpreterBuilder::new(family, settings.clone());
            upstream = interpreter.cache_key()?;
            let layer = resolve_layer(cache, tool, &mut interpreter, base_digest).await?;
            self.ready(layer, resolved);
        }

        self.phase("installing dependencies");
        let mut deps = DependencyBuilder::new(family, Arc::clone(&self.context), settings.clone());
        let slot = cache_slot(cache, &deps)?;
        if let Some(layer) = lookup(cache, slot.as_ref(), base_digest, &mut deps).await? {
            let hit = Resolved {
                name: deps.name(),
                layer,
                source: LayerSource::Cached,
                installed: false,
                pending: None,
            };
            self.ready(hit, resolved);
            return Ok(());
        }

        if self.options.per_package
            && family.supports_per_package()
            && can_resolve_packages(family, self.context.as_ref())
        {
            // holds resolved artifacts until every package layer is built
            let resolution = resolve_packages(family, self.context.as_ref(), &settings, tool).await?;
            let batch = parallel::PackageBatch {
                family,
                settings,
                upstream,
                cache: self.cache.clone(),
                tool: Arc::clone(&self.tool),
                base_digest: base_digest.to_string(),
                jobs: self.options.jobs,
            };
            for layer in parallel::build_packages(batch, resolution.packages.clone()).await? {
                self.ready(layer, resolved);
            }
        } else {
            let layer = build_layer(tool, &mut deps, slot).await?;
            self.ready(layer, resolved);
        }
        Ok(())
    }

    /// Vendor directories in the context never reach the image once a
    /// dependency phase has installed them fresh
    async fn app_layer(&self, family: Option<RuntimeFamily>) -> KilnResult<Resolved> {
        let overrides = LayerOverrides {
            entrypoint: self.options.entrypoint.clone(),
            exposed_ports: self.options.exposed_ports.clone(),
            ..Default::default()
        };
        let mut app = AppBuilder::new(
            Arc::clone(&self.context),
            self.options.app_destination.clone(),
            overrides,
        )
        .excluding(family.map(|f| f.vendor_dirs()).unwrap_or_default().iter().copied());
        let layer = app.build(self.tool.as_ref()).await?;
        Ok(Resolved {
            name: app.name(),
            layer,
            source: LayerSource::Built,
            installed: false,
            pending: None,
        })
    }

    /// Write back fresh layers. Failures are logged and never fail the build.
    async fn store_pending(&self, base_digest: &str, resolved: &[Resolved], report: &mut BuildReport) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        for pending in resolved.iter().filter_map(|r| r.pending.as_ref()) {
            match cache
                .store(base_digest, &pending.namespace, &pending.checksum, &pending.layer)
                .await
            {
                Ok(true) => report.stores += 1,
                Ok(false) => debug!(namespace = %pending.namespace, "cache entry unchanged"),
                Err(e) => warn!(
                    namespace = %pending.namespace,
                    error = %e,
                    "failed to store cache entry"
                ),
            }
        }
    }

    fn sink(&self) -> OutputSink {
        match &self.options.output {
            OutputTarget::Push => OutputSink::Registry {
                registry: Arc::clone(&self.registry),
                reference: self.options.target.clone(),
            },
            OutputTarget::Tarball(path) => OutputSink::Tarball {
                path: path.clone(),
                reference: self.options.target.clone(),
            },
        }
    }
}

fn summary(name: &str, layer: &Layer, source: LayerSource) -> LayerSummary {
    LayerSummary {
        name: name.to_string(),
        diff_id: layer.diff_id().to_string(),
        digest: layer.digest().to_string(),
        size: layer.size(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::tool::testing::{install_dir, ScriptedTool};
    use crate::builder::ToolOutput;
    use crate::error::KilnError;
    use crate::registry::MemoryRegistry;
    use std::fs;
    use tempfile::TempDir;

    fn python_app(requirements: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("requirements.txt"), requirements).unwrap();
        fs::write(dir.path().join("main.py"), "import flask\n").unwrap();
        dir
    }

    fn options(dir: &TempDir) -> BuildOptions {
        BuildOptions::new(ImageRef::parse("team/app:v1").unwrap(), dir.path())
    }

    #[test]
    fn cache_repository_selection() {
        let dir = TempDir::new().unwrap();
        let mut opts = options(&dir);
        assert_eq!(opts.cache_repository(), "team/app/cache");
        opts.cache_repository = Some("shared".into());
        assert_eq!(opts.cache_repository(), "shared");
        opts.global_cache = true;
        assert_eq!(opts.cache_repository(), "kiln-global-cache");
    }

    #[tokio::test]
    async fn python_build_layers_in_order() {
        let dir = python_app("flask==0.12.0\n");
        let registry = Arc::new(MemoryRegistry::new());
        let tool = Arc::new(ScriptedTool::installing());
        let session = BuildSession::new(options(&dir), registry.clone(), tool.clone()).unwrap();

        let report = session.run().await.unwrap();
        let names: Vec<&str> = report.layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["interpreter", "dependencies", "app"]);
        assert_eq!(report.builds, 2);
        assert_eq!(report.stores, 2);

        let image = registry.pull(&ImageRef::parse("team/app:v1").unwrap()).await.unwrap();
        assert_eq!(image.digest().unwrap(), report.digest);
        assert_eq!(image.config().config.env_var("VIRTUAL_ENV"), Some("/env"));
        assert_eq!(image.config().config.working_dir.as_deref(), Some("/srv"));
        assert_eq!(image.created(), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn no_descriptors_skips_dependency_phases() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("index.html"), "<p/>").unwrap();
        let tool = Arc::new(ScriptedTool::installing());
        let session =
            BuildSession::new(options(&dir), Arc::new(MemoryRegistry::new()), tool.clone()).unwrap();

        let report = session.run().await.unwrap();
        assert_eq!(report.layers.len(), 1);
        assert!(tool.calls().is_empty());
    }

    #[tokio::test]
    async fn cache_disabled_never_stores() {
        let dir = python_app("flask==0.12.0\n");
        let registry = Arc::new(MemoryRegistry::new());
        let mut opts = options(&dir);
        opts.cache_enabled = false;
        let session =
            BuildSession::new(opts, registry.clone(), Arc::new(ScriptedTool::installing())).unwrap();

        let report = session.run().await.unwrap();
        assert_eq!(report.stores, 0);
        assert_eq!(report.cache_misses, 0);
        // only the final image push
        assert_eq!(registry.push_count(), 1);
    }

    #[tokio::test]
    async fn tool_failure_stores_and_delivers_nothing() {
        let dir = python_app("nosuchpkg==1\n");
        let registry = Arc::new(MemoryRegistry::new());
        let tool = Arc::new(ScriptedTool::new(|inv| {
            if inv.args.iter().any(|a| a == "-r") {
                Ok(ToolOutput {
                    code: 1,
                    stderr: "No matching distribution".into(),
                    ..Default::default()
                })
            } else {
                fs::create_dir_all(install_dir(inv)).unwrap();
                Ok(ToolOutput::default())
            }
        }));
        let session = BuildSession::new(options(&dir), registry.clone(), tool).unwrap();

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, KilnError::ToolFailed { .. }));
        assert_eq!(registry.push_count(), 0);
    }

    #[tokio::test]
    async fn per_package_layers_sorted_by_name() {
        let dir = python_app("flask==0.12.0\n");
        let mut opts = options(&dir);
        opts.per_package = true;
        let tool = Arc::new(ScriptedTool::new(|inv| {
            if let Some(wheels) = inv.flag_value("-w") {
                for name in ["Werkzeug-3.0.1-py3-none-any.whl", "Flask-0.12.0-py3-none-any.whl"] {
                    fs::write(std::path::Path::new(wheels).join(name), b"").unwrap();
                }
            } else {
                let target = install_dir(inv);
                fs::create_dir_all(&target).unwrap();
                fs::write(target.join("marker"), inv.command_line()).unwrap();
            }
            Ok(ToolOutput::default())
        }));
        let session =
            BuildSession::new(opts, Arc::new(MemoryRegistry::new()), tool).unwrap();

        let report = session.run().await.unwrap();
        let names: Vec<&str> = report.layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["interpreter", "flask==0.12.0", "werkzeug==3.0.1", "app"]
        );
        assert_eq!(report.stores, 3);
        assert_eq!(report.cache_misses, report.stores);
    }

    #[tokio::test]
    async fn stale_vendor_dir_never_reaches_image() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("package.json"), "{}").unwrap();
        fs::write(dir.path().join("server.js"), "listen()").unwrap();
        fs::create_dir_all(dir.path().join("node_modules/left-pad")).unwrap();
        fs::write(dir.path().join("node_modules/left-pad/index.js"), "stale").unwrap();
        let registry = Arc::new(MemoryRegistry::new());
        let session = BuildSession::new(
            options(&dir),
            registry.clone(),
            Arc::new(ScriptedTool::installing()),
        )
        .unwrap();

        session.run().await.unwrap();
        let image = registry.pull(&ImageRef::parse("team/app:v1").unwrap()).await.unwrap();
        let app = image.layers().last().unwrap();
        let entries = app.entries().unwrap();
        assert!(entries.contains(&"srv/server.js".to_string()));
        assert!(entries.iter().all(|e| !e.starts_with("srv/node_modules")));
    }

    #[derive(Default)]
    struct Recorder(std::sync::Mutex<Vec<(String, LayerSource)>>);

    impl BuildObserver for Recorder {
        fn layer_ready(&self, name: &str, source: LayerSource) {
            self.0.lock().unwrap().push((name.to_string(), source));
        }
    }

    #[tokio::test]
    async fn observer_sees_hits_on_rebuild() {
        let dir = python_app("flask==0.12.0\n");
        let registry = Arc::new(MemoryRegistry::new());
        let tool = Arc::new(ScriptedTool::installing());

        BuildSession::new(options(&dir), registry.clone(), tool.clone())
            .unwrap()
            .run()
            .await
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        let report = BuildSession::new(options(&dir), registry, tool)
            .unwrap()
            .with_observer(recorder.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(report.builds, 0);
        assert_eq!(report.cache_hits, 2);
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                ("interpreter".to_string(), LayerSource::Cached),
                ("dependencies".to_string(), LayerSource::Cached),
                ("app".to_string(), LayerSource::Built),
            ]
        );
    }
}
