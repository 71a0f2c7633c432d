//! Build command - turn an application directory into an image

use crate::builder::ProcessTool;
use crate::cache::ttl_from_days;
use crate::cli::args::{BuildArgs, OutputFormat};
use crate::config::{Config, ConfigManager};
use crate::error::{KilnError, KilnResult};
use crate::orchestrator::{BuildOptions, BuildReport, BuildSession, OutputTarget};
use crate::registry::{ImageRef, LocalRegistry};
use crate::ui::{self, BuildProgress, UiContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Execute the build command
pub async fn execute(args: BuildArgs, manager: &ConfigManager) -> KilnResult<()> {
    let config = manager.load_for_context(&args.context).await?;
    let options = build_options(&args, &config)?;
    let ctx = UiContext::detect().for_format(args.format);

    debug!(registry = %config.registry.path.display(), "using local registry");
    let registry = Arc::new(LocalRegistry::new(&config.registry.path));
    let progress = Arc::new(BuildProgress::new(&ctx, &options.target.to_string()));
    let session = BuildSession::new(options, registry, Arc::new(ProcessTool::new()))?
        .with_observer(progress.clone());

    let result = with_timeout(args.timeout, session.run()).await;
    progress.finish();
    let report = result?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Plain => println!("{}", report.digest),
        OutputFormat::Table => print_report(&ctx, &report, session.options()),
    }
    Ok(())
}

/// Bound a pipeline future by `--timeout` seconds
async fn with_timeout<T>(
    secs: Option<u64>,
    fut: impl std::future::Future<Output = KilnResult<T>>,
) -> KilnResult<T> {
    match secs {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), fut)
            .await
            .unwrap_or(Err(KilnError::Timeout(secs))),
        None => fut.await,
    }
}

/// Resolve flags over configuration
pub(crate) fn build_options(args: &BuildArgs, config: &Config) -> KilnResult<BuildOptions> {
    let target = ImageRef::parse(&args.target)?;
    if target.is_digest() {
        return Err(KilnError::ImageRefInvalid {
            reference: args.target.clone(),
            reason: "target must be a tag, not a digest".to_string(),
        });
    }

    let mut options = BuildOptions::new(target, &args.context);
    options.base_image = args
        .base
        .clone()
        .unwrap_or_else(|| config.build.base_image.clone());
    options.runtime = args.runtime.or(config.build.runtime);
    options.destination = args
        .destination
        .clone()
        .or_else(|| config.build.destination.clone());
    options.app_destination = config.build.app_destination.clone();
    options.entrypoint = args
        .entrypoint
        .clone()
        .or_else(|| config.build.entrypoint.clone());
    options.exposed_ports = if args.ports.is_empty() {
        config.build.exposed_ports.clone()
    } else {
        Some(args.ports.clone())
    };
    options.jobs = args.jobs.unwrap_or(config.build.jobs).max(1);

    options.cache_enabled = config.cache.enabled && !args.no_cache;
    options.global_cache = config.cache.global || args.global_cache;
    options.per_package = config.cache.per_package || args.per_package;
    options.cache_repository = config.cache.repository.clone();
    options.global_repository = config.cache.global_repository.clone();
    options.cache_version = config.cache.version.clone();
    options.ttl = ttl_from_days(config.cache.ttl_days);

    options.python = config.python.interpreter.clone();
    options.python_version = config.python.version.clone();
    options.npm = config.node.tool.clone();
    options.composer = config.php.tool.clone();

    if let Some(path) = &args.tarball {
        options.output = OutputTarget::Tarball(path.clone());
    }
    Ok(options)
}

fn print_report(ctx: &UiContext, report: &BuildReport, options: &BuildOptions) {
    ui::section(ctx, "Layers");
    for layer in report.added_layers() {
        let short = layer.digest.trim_start_matches("sha256:");
        let short = &short[..short.len().min(12)];
        ui::step_ok_detail(
            ctx,
            &format!("{:<24} {}", layer.name, short),
            &format!("{}, {} bytes", layer.source, layer.size),
        );
    }
    println!();
    ui::key_value(ctx, "cache", &format!(
        "{} hit(s), {} miss(es), {} stored",
        report.cache_hits, report.cache_misses, report.stores
    ));
    ui::key_value(ctx, "installs", &report.builds.to_string());
    ui::key_value(ctx, "digest", &report.digest);
    let destination = match &options.output {
        OutputTarget::Push => options.target.to_string(),
        OutputTarget::Tarball(path) => path.display().to_string(),
    };
    ui::outro_success(ctx, &format!("Built {}", destination));
}
