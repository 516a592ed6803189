//! CLI command implementations

pub mod build;
pub mod cache;
pub mod image;
pub mod images;
pub mod pull;
pub mod run;

use anyhow::{Context, Result};
use strata_core::{Config, ImageStore};

/// Opens the image store under the configured data directory.
pub async fn open_store(config: &Config) -> Result<ImageStore> {
    ImageStore::open(&config.data_path())
        .await
        .with_context(|| format!("Failed to open image store at {}", config.data_dir))
}

/// Parses `KEY=VALUE` pairs, keeping their order.
pub fn parse_key_values(values: &[String], what: &str) -> Result<Vec<(String, String)>> {
    values
        .iter()
        .map(|v| match v.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(anyhow::anyhow!("Invalid {} format: {} (expected KEY=VALUE)", what, v)),
        })
        .collect()
}
