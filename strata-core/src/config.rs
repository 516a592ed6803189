//! Configuration management.

use crate::error::{Result, StrataError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How RUN steps and containers are isolated from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// `chroot` when running as root, host otherwise.
    #[default]
    Auto,
    /// Commands run with the image root filesystem as `/`. Requires root.
    Chroot,
    /// Commands run on the host with their cwd inside the root filesystem.
    Host,
}

impl Isolation {
    /// Resolves `Auto` to a concrete mode for the current process.
    pub fn resolve(self) -> Self {
        match self {
            Isolation::Auto => {
                #[cfg(unix)]
                {
                    if unsafe { libc::geteuid() } == 0 {
                        return Isolation::Chroot;
                    }
                }
                Isolation::Host
            }
            other => other,
        }
    }
}

impl std::str::FromStr for Isolation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "chroot" => Ok(Self::Chroot),
            "host" | "none" => Ok(Self::Host),
            other => Err(format!("unknown isolation mode '{}' (auto, chroot, host)", other)),
        }
    }
}

/// When base images are fetched from a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull only if the image is not in the local store.
    #[default]
    Missing,
    /// Always pull, refreshing the local copy.
    Always,
    /// Never contact a registry.
    Never,
}

impl std::str::FromStr for PullPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "missing" | "if-not-present" => Ok(Self::Missing),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            other => Err(format!("unknown pull policy '{}' (missing, always, never)", other)),
        }
    }
}

/// Persistent configuration for Strata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub cache_size_limit_bytes: u64,
    pub step_timeout_secs: u64,
    pub isolation: Isolation,
    pub pull_policy: PullPolicy,
    pub data_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            cache_size_limit_bytes: 10 * 1024 * 1024 * 1024, // 10 GB
            step_timeout_secs: 3600,
            isolation: Isolation::Auto,
            pull_policy: PullPolicy::Missing,
            data_dir: paths::data_dir().to_string_lossy().to_string(),
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_dir().join("config.json")
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a file, falling back to defaults if it is absent.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| StrataError::InvalidConfig {
            reason: format!("Failed to read config: {}", e),
        })?;
        serde_json::from_str(&content).map_err(|e| StrataError::InvalidConfig {
            reason: format!("Failed to parse config: {}", e),
        })
    }

    /// Data directory as a path.
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    /// Layer cache under the data directory.
    pub fn cache_path(&self) -> PathBuf {
        self.data_path().join("cache").join("layers")
    }

    /// Scratch space for in-flight builds.
    pub fn builds_path(&self) -> PathBuf {
        self.data_path().join("builds")
    }

    /// Container root filesystems.
    pub fn containers_path(&self) -> PathBuf {
        self.data_path().join("containers")
    }

    /// Per-step timeout; zero disables it.
    pub fn step_timeout(&self) -> Option<std::time::Duration> {
        (self.step_timeout_secs > 0).then(|| std::time::Duration::from_secs(self.step_timeout_secs))
    }
}
