//! Image management commands for Strata CLI.

use super::images::{format_created, format_image_id, format_size};
use super::open_store;
use anyhow::{Context, Result};
use chrono::Utc;
use colored::Colorize;
use strata_core::types::LayerHistory;
use strata_core::Config;
use tabled::{Table, Tabled};

/// Width of the CREATED BY column before truncation.
const CREATED_BY_WIDTH: usize = 60;

#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "LAYER")]
    layer: String,
    #[tabled(rename = "CREATED")]
    created: String,
    #[tabled(rename = "CREATED BY")]
    created_by: String,
    #[tabled(rename = "SIZE")]
    size: String,
    #[tabled(rename = "COMMENT")]
    comment: String,
}

/// Shows one row per build step, newest first.
pub async fn history(image: &str, config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let img = store.resolve(image).await.with_context(|| format!("No such image: {}", image))?;

    let now = Utc::now();
    let rows: Vec<HistoryRow> = img
        .history
        .iter()
        .rev()
        .map(|entry| HistoryRow {
            layer: history_layer(entry),
            created: format_created(entry.created_at, now),
            created_by: truncate(&entry.created_by, CREATED_BY_WIDTH),
            size: format_size(entry.size_bytes),
            comment: entry.comment.clone(),
        })
        .collect();

    println!("{}", Table::new(rows));
    Ok(())
}

/// Prints the image record as JSON, with its tags.
pub async fn inspect(image: &str, config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let img = store.resolve(image).await.with_context(|| format!("No such image: {}", image))?;
    let tags = store.state().tags_for(&img.id).await?;

    let mut value = serde_json::to_value(&img).context("Failed to serialize image")?;
    if let Some(obj) = value.as_object_mut() {
        let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        obj.insert("tags".to_string(), serde_json::json!(tags));
    }

    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Removes each reference in turn, stopping at the first failure.
pub async fn rmi(images: &[String], force: bool, config: &Config) -> Result<()> {
    let store = open_store(config).await?;

    for image in images {
        let outcome = store.remove(image, force).await.with_context(|| format!("Failed to remove {}", image))?;

        for tag in &outcome.untagged {
            println!("Untagged: {}", tag.to_string().yellow());
        }
        if let Some(id) = &outcome.deleted {
            println!("Deleted: {}", id.red());
        }
        if outcome.blobs_removed > 0 {
            println!("  {} unreferenced layer(s) removed", outcome.blobs_removed);
        }
    }
    Ok(())
}

fn history_layer(entry: &LayerHistory) -> String {
    match &entry.digest {
        Some(digest) => format_image_id(digest),
        None => "<missing>".to_string(),
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut out: String = text.chars().take(width.saturating_sub(3)).collect();
    out.push_str("...");
    out
}
