//! Bounded concurrent per-package layer builds
//!
//! Packages are built on a `JoinSet` with a semaphore capping the number of
//! concurrent installs. The first failure stops tasks that have not started
//! yet; tasks already running are drained. Results come back in package
//! order regardless of completion order.

use super::{resolve_layer, Resolved};
use crate::builder::{BuildTool, BuilderSettings, PackageBuilder, PackageSpec};
use crate::cache::{CacheKey, CacheStore};
use crate::error::{KilnError, KilnResult};
use crate::family::RuntimeFamily;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Shared inputs of one phase-2 batch
pub(crate) struct PackageBatch {
    pub family: RuntimeFamily,
    pub settings: BuilderSettings,
    pub upstream: Option<CacheKey>,
    pub cache: Option<CacheStore>,
    pub tool: Arc<dyn BuildTool>,
    pub base_digest: String,
    pub jobs: usize,
}

pub(crate) async fn build_packages(
    batch: PackageBatch,
    mut packages: Vec<PackageSpec>,
) -> KilnResult<Vec<Resolved>> {
    packages.sort();
    packages.dedup();
    info!(packages = packages.len(), jobs = batch.jobs, "building per-package layers");

    let semaphore = Arc::new(Semaphore::new(batch.jobs.max(1)));
    let failed = Arc::new(AtomicBool::new(false));
    let mut join_set = JoinSet::new();

    for (index, package) in packages.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let failed = Arc::clone(&failed);
        let cache = batch.cache.clone();
        let tool = Arc::clone(&batch.tool);
        let upstream = batch.upstream.clone();
        let settings = batch.settings.clone();
        let base_digest = batch.base_digest.clone();
        let family = batch.family;

        join_set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| KilnError::Internal(format!("package semaphore closed: {}", e)))?;
            if failed.load(Ordering::SeqCst) {
                debug!(package = %package.name, "skipping after earlier failure");
                return Ok((index, None));
            }
            let mut builder = PackageBuilder::new(family, package, upstream, settings);
            let result = resolve_layer(cache.as_ref(), tool.as_ref(), &mut builder, &base_digest).await;
            if result.is_err() {
                failed.store(true, Ordering::SeqCst);
            }
            result.map(|resolved| (index, Some(resolved)))
        });
    }

    let mut first_error: Option<KilnError> = None;
    let mut results = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok((index, Some(resolved)))) => results.push((index, resolved)),
            Ok(Ok((_, None))) => {}
            Ok(Err(e)) => {
                if first_error.is_none() {
                    error!(error = %e, "package build failed");
                    first_error = Some(e);
                } else {
                    debug!(error = %e, "additional package failure");
                }
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(KilnError::Internal(format!("package build task failed: {}", e)));
                }
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    results.sort_by_key(|(index, _)| *index);
    Ok(results.into_iter().map(|(_, resolved)| resolved).collect())
}
