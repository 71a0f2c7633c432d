//! Application layer: the build context at the app destination. Never cached.

use super::{BuildTool, LayerBuilder, LayerSlot};
use crate::cache::CacheKey;
use crate::context::BuildContext;
use crate::error::KilnResult;
use crate::layer::{Layer, LayerArchive, LayerOverrides};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub struct AppBuilder {
    context: Arc<dyn BuildContext>,
    destination: String,
    overrides: LayerOverrides,
    /// Top-level context directories left out of the layer
    excluded: Vec<String>,
    slot: LayerSlot,
}

impl AppBuilder {
    /// `overrides` carries the configured entrypoint and exposed ports. The
    /// working directory defaults to the app destination.
    pub fn new(context: Arc<dyn BuildContext>, destination: impl Into<String>, mut overrides: LayerOverrides) -> Self {
        let destination = destination.into();
        if overrides.working_dir.is_none() {
            overrides.working_dir = Some(destination.clone());
        }
        Self {
            context,
            destination,
            overrides,
            excluded: Vec::new(),
            slot: LayerSlot::new("app"),
        }
    }

    /// Leave out top-level directories such as a stale `node_modules` that
    /// would mask a freshly installed dependency layer
    pub fn excluding<I, S>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded.extend(dirs.into_iter().map(Into::into));
        self
    }

    fn is_excluded(&self, rel: &str) -> bool {
        let top = rel.split('/').next().unwrap_or(rel);
        self.excluded.iter().any(|dir| dir == top)
    }
}

#[async_trait]
impl LayerBuilder for AppBuilder {
    fn name(&self) -> String {
        "app".to_string()
    }

    fn namespace(&self) -> Option<String> {
        None
    }

    fn cache_key(&self) -> KilnResult<Option<CacheKey>> {
        Ok(None)
    }

    async fn build(&mut self, _tool: &dyn BuildTool) -> KilnResult<Arc<Layer>> {
        self.slot.start()?;
        let prefix = self.destination.trim_matches('/');

        let mut archive = LayerArchive::new();
        let files: Vec<String> = self
            .context
            .list_files()?
            .into_iter()
            .filter(|rel| !self.is_excluded(rel))
            .collect();
        for rel in &files {
            let mode = if self.context.is_executable(rel) { 0o755 } else { 0o644 };
            let path = if prefix.is_empty() {
                rel.clone()
            } else {
                format!("{}/{}", prefix, rel)
            };
            archive.append_file(&path, &self.context.get_file(rel)?, mode)?;
        }
        debug!(files = files.len(), dest = %self.destination, "packaged application");

        let layer = Layer::from_tar(&archive.finish()?, self.overrides.clone())?;
        Ok(self.slot.fill(layer))
    }

    fn set_cached(&mut self, layer: Arc<Layer>) -> KilnResult<()> {
        self.slot.fill_cached(layer)
    }

    fn layer(&self) -> KilnResult<Arc<Layer>> {
        self.slot.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ProcessTool;
    use crate::context::DirectoryContext;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    #[tokio::test]
    async fn packages_context_at_destination() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.py"), "print(1)").unwrap();
        fs::write(dir.path().join("run.sh"), "#!/bin/sh").unwrap();
        fs::set_permissions(dir.path().join("run.sh"), fs::Permissions::from_mode(0o755)).unwrap();
        let ctx: Arc<dyn BuildContext> = Arc::new(DirectoryContext::open(dir.path()).unwrap());

        let overrides = LayerOverrides {
            entrypoint: Some(vec!["python".into(), "main.py".into()]),
            exposed_ports: Some(vec!["8080".into()]),
            ..Default::default()
        };
        let mut builder = AppBuilder::new(ctx, "/srv", overrides);
        assert!(builder.cache_key().unwrap().is_none());
        assert!(builder.namespace().is_none());

        let layer = builder.build(&ProcessTool::new()).await.unwrap();
        assert_eq!(layer.entries().unwrap(), vec!["srv", "srv/main.py", "srv/run.sh"]);
        assert_eq!(layer.overrides().working_dir.as_deref(), Some("/srv"));
        assert_eq!(
            layer.overrides().entrypoint,
            Some(vec!["python".to_string(), "main.py".to_string()])
        );
    }

    #[tokio::test]
    async fn excluded_dirs_stay_out_of_layer() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("server.js"), "listen()").unwrap();
        fs::create_dir_all(dir.path().join("node_modules/left-pad")).unwrap();
        fs::write(dir.path().join("node_modules/left-pad/index.js"), "stale").unwrap();
        fs::create_dir_all(dir.path().join("lib/node_modules")).unwrap();
        fs::write(dir.path().join("lib/node_modules/keep.js"), "nested").unwrap();
        let ctx: Arc<dyn BuildContext> = Arc::new(DirectoryContext::open(dir.path()).unwrap());

        let layer = AppBuilder::new(ctx, "/srv", LayerOverrides::default())
            .excluding(["node_modules"])
            .build(&ProcessTool::new())
            .await
            .unwrap();
        let entries = layer.entries().unwrap();
        assert!(entries.iter().all(|e| !e.starts_with("srv/node_modules")));
        assert!(entries.contains(&"srv/lib/node_modules/keep.js".to_string()));
        assert!(entries.contains(&"srv/server.js".to_string()));
    }

    #[tokio::test]
    async fn identical_context_identical_layer() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.py"), "print(1)").unwrap();
        let ctx: Arc<dyn BuildContext> = Arc::new(DirectoryContext::open(dir.path()).unwrap());

        let a = AppBuilder::new(ctx.clone(), "/srv", LayerOverrides::default())
            .build(&ProcessTool::new())
            .await
            .unwrap();
        let b = AppBuilder::new(ctx, "/srv", LayerOverrides::default())
            .build(&ProcessTool::new())
            .await
            .unwrap();
        assert_eq!(a.digest(), b.digest());
    }
}
