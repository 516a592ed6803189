//! Centralized path configuration for Strata.
//!
//! The CLI and library resolve the data directory and config file here.

use std::path::PathBuf;

/// Get the Strata data directory.
///
/// Resolution order:
/// 1. `STRATA_DATA_DIR` environment variable
/// 2. `/var/lib/strata` if it exists (system install)
/// 3. `~/.strata` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STRATA_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/strata");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".strata")).unwrap_or(system_dir)
}

/// Get the configuration directory.
///
/// `STRATA_CONFIG_DIR` overrides the platform config directory.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STRATA_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    dirs::config_dir().map(|c| c.join("strata")).unwrap_or_else(|| data_dir().join("config"))
}
