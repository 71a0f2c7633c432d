//! Cache command - inspect and prune the layer cache

use crate::cache::{known_namespaces, ttl_from_days, CacheEntry, CacheStore};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::Config;
use crate::error::KilnResult;
use crate::registry::LocalRegistry;
use crate::ui::{self, TaskSpinner, UiContext};
use chrono::{DateTime, Utc};
use console::style;
use std::sync::Arc;
use tracing::debug;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> KilnResult<()> {
    let store = open_store(args.repository, config);
    let ctx = UiContext::detect();

    match args.action {
        CacheAction::List { format } => list_entries(&store, format).await,
        CacheAction::Gc { days, dry_run } => {
            gc_entries(&ctx, &store, days.unwrap_or(config.cache.ttl_days), dry_run).await
        }
        CacheAction::Clear { yes } => clear_entries(&ctx.with_auto_yes(yes), &store).await,
    }
}

/// Cache repository precedence: flag, configured repository, global repository
fn open_store(repository: Option<String>, config: &Config) -> CacheStore {
    let repository = repository
        .or_else(|| config.cache.repository.clone())
        .unwrap_or_else(|| config.cache.global_repository.clone());
    debug!(repository = %repository, registry = %config.registry.path.display(), "opening cache");
    CacheStore::new(
        Arc::new(LocalRegistry::new(&config.registry.path)),
        repository,
        ttl_from_days(config.cache.ttl_days),
    )
}

async fn list_entries(store: &CacheStore, format: OutputFormat) -> KilnResult<()> {
    let entries = store.list(&known_namespaces()).await?;

    if entries.is_empty() && !matches!(format, OutputFormat::Json) {
        println!("No cache entries in {}.", store.repository());
        return Ok(());
    }

    let now = Utc::now();
    match format {
        OutputFormat::Table => print_entry_table(store, &entries, now),
        OutputFormat::Json => print_entry_json(store, &entries, now)?,
        OutputFormat::Plain => print_entry_plain(&entries),
    }
    Ok(())
}

fn print_entry_table(store: &CacheStore, entries: &[CacheEntry], now: DateTime<Utc>) {
    println!(
        "{:<22} {:<14} {:>12} {:<10} {:<18}",
        "NAMESPACE", "TAG", "SIZE", "STATE", "CREATED"
    );
    println!("{}", "-".repeat(80));

    for entry in entries {
        let state = if entry.is_expired(store.ttl(), now) {
            style("expired").yellow().to_string()
        } else {
            style("fresh").green().to_string()
        };
        println!(
            "{:<22} {:<14} {:>12} {:<10} {:<18}",
            entry.namespace,
            &entry.tag[..entry.tag.len().min(12)],
            entry.layer.size(),
            state,
            entry.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!();
    println!("Total: {}", count(entries.len()));
}

fn print_entry_json(store: &CacheStore, entries: &[CacheEntry], now: DateTime<Utc>) -> KilnResult<()> {
    #[derive(serde::Serialize)]
    struct EntryJson {
        namespace: String,
        tag: String,
        checksum: Option<String>,
        digest: String,
        size: u64,
        created_at: String,
        expired: bool,
    }

    let json_entries: Vec<EntryJson> = entries
        .iter()
        .map(|e| EntryJson {
            namespace: e.namespace.clone(),
            tag: e.tag.clone(),
            checksum: e.checksum.clone(),
            digest: e.layer.digest().to_string(),
            size: e.layer.size(),
            created_at: e.created_at.to_rfc3339(),
            expired: e.is_expired(store.ttl(), now),
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&json_entries)?);
    Ok(())
}

fn print_entry_plain(entries: &[CacheEntry]) {
    for entry in entries {
        println!("{}:{}", entry.namespace, entry.tag);
    }
}

/// Remove entries older than `days`
async fn gc_entries(ctx: &UiContext, store: &CacheStore, days: u32, dry_run: bool) -> KilnResult<()> {
    let now = Utc::now();
    let expired = store
        .gc(&known_namespaces(), ttl_from_days(days), now, true)
        .await?;

    if expired.is_empty() {
        ui::step_info(ctx, &format!("No cache entries older than {} days.", days));
        return Ok(());
    }

    ui::section(ctx, &format!("{} older than {} days", count(expired.len()), days));
    for entry in &expired {
        ui::remark(
            ctx,
            &format!("{}:{} ({} days old)", entry.namespace, entry.tag, entry.age_days(now)),
        );
    }

    if dry_run {
        ui::step_warn(ctx, "Dry run - no entries removed.");
        return Ok(());
    }

    let mut spinner = TaskSpinner::new(ctx);
    spinner.start("Removing cache entries...");
    let removed = match store.gc(&known_namespaces(), ttl_from_days(days), now, false).await {
        Ok(removed) => removed,
        Err(e) => {
            spinner.stop_error("Failed to remove cache entries");
            return Err(e);
        }
    };
    spinner.stop(&format!("Removed {}", count(removed.len())));
    Ok(())
}

/// Remove every entry after confirmation
async fn clear_entries(ctx: &UiContext, store: &CacheStore) -> KilnResult<()> {
    let namespaces = known_namespaces();
    let entries = store.list(&namespaces).await?;

    if entries.is_empty() {
        ui::step_info(ctx, "No cache entries to clear.");
        return Ok(());
    }

    ui::step_warn(
        ctx,
        &format!("This will remove {} from {}", count(entries.len()), store.repository()),
    );
    if !ui::confirm(ctx, "Are you sure?", false).await? {
        ui::remark(ctx, "Aborted.");
        return Ok(());
    }

    let mut spinner = TaskSpinner::new(ctx);
    spinner.start("Clearing cache...");
    match store.clear(&namespaces).await {
        Ok(removed) => {
            spinner.stop(&format!("Cleared {}", count(removed)));
            Ok(())
        }
        Err(e) => {
            spinner.stop_error("Failed to clear cache");
            Err(e)
        }
    }
}

fn count(n: usize) -> String {
    format!("{} cache entr{}", n, if n == 1 { "y" } else { "ies" })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_precedence() {
        let mut config = Config::default();
        assert_eq!(open_store(None, &config).repository(), "kiln-global-cache");

        config.cache.repository = Some("team/app/cache".to_string());
        assert_eq!(open_store(None, &config).repository(), "team/app/cache");
        assert_eq!(
            open_store(Some("other".to_string()), &config).repository(),
            "other"
        );
    }

    #[test]
    fn entry_counts() {
        assert_eq!(count(1), "1 cache entry");
        assert_eq!(count(3), "3 cache entries");
    }
}
