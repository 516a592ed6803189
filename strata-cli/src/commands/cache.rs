//! Build cache commands for Strata CLI.

use super::images::{format_created, format_image_id, format_size};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::Colorize;
use strata_core::builder::LayerCache;
use strata_core::Config;
use tabled::{Table, Tabled};

#[derive(Tabled)]
struct CacheRow {
    #[tabled(rename = "CACHE KEY")]
    key: String,
    #[tabled(rename = "LAYER")]
    layer: String,
    #[tabled(rename = "SIZE")]
    size: String,
    #[tabled(rename = "LAST USED")]
    last_used: String,
    #[tabled(rename = "CREATED BY")]
    created_by: String,
}

fn open_cache(config: &Config) -> Result<LayerCache> {
    LayerCache::with_config(config.cache_path(), config.cache_size_limit_bytes)
        .with_context(|| format!("Failed to open build cache at {}", config.cache_path().display()))
}

/// Lists cached step results, most recently used first.
pub fn ls(config: &Config) -> Result<()> {
    let cache = open_cache(config)?;
    let entries = cache.list()?;

    if entries.is_empty() {
        println!("Build cache is empty.");
        return Ok(());
    }

    let now = Utc::now();
    let rows: Vec<CacheRow> = entries
        .iter()
        .map(|entry| CacheRow {
            key: format_image_id(&entry.cache_key),
            layer: entry.digest.as_deref().map(format_image_id).unwrap_or_else(|| "-".to_string()),
            size: format_size(entry.size_bytes),
            last_used: format_created(from_millis(entry.last_accessed), now),
            created_by: entry.created_by.clone(),
        })
        .collect();

    println!("{}", Table::new(rows));
    println!();
    println!(
        "{} entries, {} of {}",
        entries.len(),
        format_size(cache.total_size()?).yellow(),
        format_size(config.cache_size_limit_bytes)
    );
    Ok(())
}

/// Evicts least recently used layers until the cache fits `keep_bytes`.
pub fn prune(keep_bytes: Option<u64>, config: &Config) -> Result<()> {
    let cache = open_cache(config)?;
    let limit = keep_bytes.unwrap_or(config.cache_size_limit_bytes);

    let evicted = cache.prune_to(limit)?;
    println!(
        "Evicted {} layer(s), cache now {}",
        evicted.to_string().yellow(),
        format_size(cache.total_size()?).green()
    );
    Ok(())
}

/// Removes every cache entry.
pub fn clear(config: &Config) -> Result<()> {
    let cache = open_cache(config)?;
    let removed = cache.clear()?;
    println!("Removed {} cache entr{}", removed, if removed == 1 { "y" } else { "ies" });
    Ok(())
}

fn from_millis(millis: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis as i64).unwrap_or_default()
}
