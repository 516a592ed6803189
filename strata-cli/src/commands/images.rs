//! Images command implementation for Strata CLI.
//!
//! Lists all images in the local store, one row per tag.

use super::open_store;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::Colorize;
use std::collections::HashMap;
use strata_core::Config;
use tabled::{Table, Tabled};

#[derive(Tabled)]
struct ImageRow {
    #[tabled(rename = "REPOSITORY")]
    repository: String,
    #[tabled(rename = "TAG")]
    tag: String,
    #[tabled(rename = "IMAGE ID")]
    image_id: String,
    #[tabled(rename = "SIZE")]
    size: String,
    #[tabled(rename = "CREATED")]
    created: String,
}

/// Lists all images in the image store.
pub async fn images(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let images = store.state().list_images().await.context("Failed to list images")?;

    if images.is_empty() {
        println!("No images found.");
        println!();
        println!("Build your first image with: {}", "strata build -t myapp .".cyan());
        return Ok(());
    }

    let tags = store.state().list_tags().await.context("Failed to list tags")?;
    let mut tags_by_image: HashMap<&str, Vec<_>> = HashMap::new();
    for record in &tags {
        tags_by_image.entry(record.image_id.as_str()).or_default().push(&record.reference);
    }

    let now = Utc::now();
    let mut rows = Vec::new();
    for img in &images {
        let row = |repository: String, tag: String| ImageRow {
            repository,
            tag,
            image_id: format_image_id(&img.id),
            size: format_size(img.size_bytes),
            created: format_created(img.created_at, now),
        };
        match tags_by_image.get(img.id.as_str()) {
            Some(references) => {
                rows.extend(references.iter().map(|r| row(r.name.clone(), r.tag.clone())));
            }
            None => rows.push(row("<none>".to_string(), "<none>".to_string())),
        }
    }

    let table = Table::new(rows).to_string();
    println!("{}", table);

    Ok(())
}

/// Formats an image ID to short form (first 12 characters).
pub(crate) fn format_image_id(id: &str) -> String {
    let hex = id.strip_prefix("sha256:").unwrap_or(id);
    hex.chars().take(12).collect()
}

/// Formats size in bytes to human-readable form.
pub(crate) fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Formats creation time relative to `now`.
pub(crate) fn format_created(created_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - created_at).num_seconds().max(0);
    if secs < 60 {
        format!("{} seconds ago", secs)
    } else if secs < 3600 {
        format!("{} minutes ago", secs / 60)
    } else if secs < 86400 {
        format!("{} hours ago", secs / 3600)
    } else if secs < 604800 {
        format!("{} days ago", secs / 86400)
    } else {
        format!("{} weeks ago", secs / 604800)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_format_image_id_sha256() {
        let id = "sha256:abcdef1234567890abcdef1234567890";
        assert_eq!(format_image_id(id), "abcdef123456");
    }

    #[test]
    fn test_format_image_id_short() {
        let id = "abc123";
        assert_eq!(format_image_id(id), "abc123");
    }

    #[test]
    fn test_format_size_bytes() {
        assert_eq!(format_size(500), "500B");
    }

    #[test]
    fn test_format_size_kb() {
        assert_eq!(format_size(5 * 1024), "5.0KB");
    }

    #[test]
    fn test_format_size_mb() {
        assert_eq!(format_size(50 * 1024 * 1024), "50.0MB");
    }

    #[test]
    fn test_format_size_gb() {
        assert_eq!(format_size(2 * 1024 * 1024 * 1024), "2.00GB");
    }

    #[test]
    fn test_format_created() {
        let now = Utc::now();
        assert_eq!(format_created(now - Duration::seconds(5), now), "5 seconds ago");
        assert_eq!(format_created(now - Duration::hours(3), now), "3 hours ago");
        assert_eq!(format_created(now - Duration::days(15), now), "2 weeks ago");
        // Clock skew
        assert_eq!(format_created(now + Duration::seconds(30), now), "0 seconds ago");
    }
}
