use wellsync_core::remote::Filter;
use wellsync_core::sync::ReadSource;
use wellsync_core::{Priority, SyncCoordinator};

use crate::cli::CacheCommands;
use crate::commands::common::{
    cache_entry_to_item, format_cache_lines, format_timestamp, normalize_table, parse_rows,
    ttl_or_default, CacheListItem,
};
use crate::error::CliError;

pub async fn run_cache(
    coordinator: &SyncCoordinator,
    command: CacheCommands,
) -> Result<(), CliError> {
    match command {
        CacheCommands::Get {
            table,
            include_stale,
            json,
        } => run_cache_get(coordinator, &table, include_stale, json),
        CacheCommands::Put {
            table,
            rows,
            priority,
            ttl_ms,
        } => run_cache_put(coordinator, &table, &rows, priority.into(), ttl_ms),
        CacheCommands::Fetch {
            table,
            ids,
            priority,
            ttl_ms,
            json,
        } => run_cache_fetch(coordinator, &table, ids, priority.into(), ttl_ms, json).await,
        CacheCommands::Evict => {
            let removed = coordinator.cache().evict_expired();
            println!("Evicted {removed} expired entr(ies)");
            Ok(())
        }
        CacheCommands::Stats { json } => run_cache_stats(coordinator, json),
        CacheCommands::Clear => {
            coordinator.cache().clear();
            println!("Cache cleared");
            Ok(())
        }
    }
}

pub fn run_cache_get(
    coordinator: &SyncCoordinator,
    table: &str,
    include_stale: bool,
    as_json: bool,
) -> Result<(), CliError> {
    let table = normalize_table(table)?;
    let entries = coordinator.cache().get_entries(&table, include_stale);

    if as_json {
        let items = entries
            .iter()
            .map(cache_entry_to_item)
            .collect::<Vec<CacheListItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No cached rows for '{table}'.");
        return Ok(());
    }
    for line in format_cache_lines(&entries) {
        println!("{line}");
    }
    Ok(())
}

pub fn run_cache_put(
    coordinator: &SyncCoordinator,
    table: &str,
    rows: &str,
    priority: Priority,
    ttl_ms: Option<u64>,
) -> Result<(), CliError> {
    let table = normalize_table(table)?;
    let rows = parse_rows(rows)?;
    let count = rows.len();
    let cache = coordinator.cache();
    cache.put(
        &table,
        rows,
        priority,
        ttl_or_default(ttl_ms, cache.config().default_ttl),
    );
    println!("Cached {count} row(s) for '{table}' at {priority} priority");
    Ok(())
}

pub async fn run_cache_fetch(
    coordinator: &SyncCoordinator,
    table: &str,
    ids: Vec<String>,
    priority: Priority,
    ttl_ms: Option<u64>,
    as_json: bool,
) -> Result<(), CliError> {
    let table = normalize_table(table)?;
    let filter = if ids.is_empty() {
        Filter::All
    } else {
        Filter::ids(coordinator.cache().config().id_column.clone(), ids)
    };
    let ttl = ttl_or_default(ttl_ms, coordinator.cache().config().default_ttl);

    let outcome = coordinator
        .read_through(&table, &filter, priority, ttl)
        .await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&outcome.rows)?);
        return Ok(());
    }

    let source = match outcome.source {
        ReadSource::Cache => "cache",
        ReadSource::Remote => "remote",
        ReadSource::StaleCache => "stale cache",
    };
    println!("{} row(s) from {source}", outcome.rows.len());
    for row in &outcome.rows {
        println!("{row}");
    }
    Ok(())
}

pub fn run_cache_stats(coordinator: &SyncCoordinator, as_json: bool) -> Result<(), CliError> {
    let stats = coordinator.cache().stats();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!(
        "Entries: {} ({} fresh, {} stale, {} expired)",
        stats.total, stats.fresh, stats.stale, stats.expired
    );
    println!(
        "Priority: {} high, {} medium, {} low",
        stats.high, stats.medium, stats.low
    );
    println!("Size: ~{} bytes", stats.approx_bytes);
    if let (Some(oldest), Some(newest)) = (stats.oldest_captured_at, stats.newest_captured_at) {
        println!(
            "Captured: {} .. {}",
            format_timestamp(oldest),
            format_timestamp(newest)
        );
    }
    Ok(())
}
