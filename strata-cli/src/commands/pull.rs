//! `strata pull` command - Pull an image from a registry

use super::open_store;
use anyhow::{Context, Result};
use colored::Colorize;
use strata_core::builder::{BaseImageResolver, StoreResolver};
use strata_core::config::PullPolicy;
use strata_core::Config;

/// Pulls an image into the local store, replacing any local copy of the tag.
pub async fn pull(image: &str, config: &Config) -> Result<()> {
    println!("Pulling image: {}", image.green());

    let store = open_store(config).await?;
    let resolver = StoreResolver::new(store, PullPolicy::Always);
    let base = resolver.resolve(image, None).await.with_context(|| format!("Failed to pull {}", image))?;

    let size: u64 = base.layers.iter().map(|l| l.size).sum();
    println!("Image pulled successfully:");
    println!("  ID:     {}", base.image_id.cyan());
    println!("  Layers: {}", base.layers.len());
    println!("  Size:   {:.2} MB", size as f64 / 1024.0 / 1024.0);

    Ok(())
}
