//! OCI registry client for pulling base images.
//!
//! Pulls return the decoded image config plus raw layer bytes; storing them
//! is left to the caller so a pull can be swapped for a fake in tests.
//!
//! Based on the OCI Distribution Spec: https://github.com/opencontainers/distribution-spec

use crate::types::ImageConfig;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::manifest::{
    ImageIndexEntry, IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE, IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
    IMAGE_LAYER_GZIP_MEDIA_TYPE, IMAGE_LAYER_MEDIA_TYPE,
};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Error type for registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid image reference {reference}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("Failed to pull {reference}: {reason}")]
    PullFailed { reference: String, reason: String },

    #[error("Unsupported platform {platform}: builds run natively on {host}")]
    UnsupportedPlatform { platform: String, host: String },

    #[error("Invalid image config: {0}")]
    InvalidConfig(String),

    #[error("Unsupported layer media type {0}")]
    UnsupportedLayer(String),
}

/// One layer as fetched from the registry.
#[derive(Debug, Clone)]
pub struct PulledLayer {
    pub media_type: String,
    pub data: Vec<u8>,
}

impl PulledLayer {
    /// Uncompressed tar bytes of the layer.
    pub fn decode(&self) -> Result<Vec<u8>, RegistryError> {
        if self.media_type.contains("zstd") {
            return Err(RegistryError::UnsupportedLayer(self.media_type.clone()));
        }

        if !self.media_type.contains("gzip") && !self.data.starts_with(&GZIP_MAGIC) {
            return Ok(self.data.clone());
        }

        let mut out = Vec::with_capacity(self.data.len() * 2);
        GzDecoder::new(self.data.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| RegistryError::PullFailed { reference: self.media_type.clone(), reason: e.to_string() })?;
        Ok(out)
    }
}

/// A pulled image, base layer first.
#[derive(Debug, Clone)]
pub struct PulledImage {
    /// Normalized reference that was pulled
    pub reference: String,
    pub config: ImageConfig,
    pub layers: Vec<PulledLayer>,
}

/// Source of base images.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Pulls `reference`, optionally for a specific `os/arch` platform.
    async fn pull(&self, reference: &str, platform: Option<&str>) -> Result<PulledImage, RegistryError>;
}

/// The `os/arch` this process can run commands for.
pub fn host_platform() -> String {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    format!("linux/{}", arch)
}

/// Selects the manifest for the host architecture.
///
/// RUN steps execute natively, so only images for the host are useful.
fn host_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let platform = host_platform();
    let (os, arch) = platform.split_once('/').unwrap_or(("linux", ""));

    debug!("Looking for {} image variant", platform);

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|p| p.os == os && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}

/// Registry client backed by `oci-distribution`.
pub struct OciRegistry {
    client: Mutex<Client>,
}

impl OciRegistry {
    pub fn new() -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::HttpsExcept(vec!["localhost".to_string()]),
            platform_resolver: Some(Box::new(host_platform_resolver)),
            ..Default::default()
        };

        Self { client: Mutex::new(Client::new(config)) }
    }
}

impl Default for OciRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for OciRegistry {
    #[instrument(skip(self), fields(image = %image))]
    async fn pull(&self, image: &str, platform: Option<&str>) -> Result<PulledImage, RegistryError> {
        if let Some(requested) = platform {
            let host = host_platform();
            if requested != host {
                return Err(RegistryError::UnsupportedPlatform { platform: requested.to_string(), host });
            }
        }

        let normalized = normalize_reference(image);
        let reference = Reference::try_from(normalized.as_str()).map_err(|e| RegistryError::InvalidReference {
            reference: image.to_string(),
            reason: e.to_string(),
        })?;

        info!("Pulling image from registry");

        let image_data = self
            .client
            .lock()
            .await
            .pull(
                &reference,
                &RegistryAuth::Anonymous,
                vec![
                    IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
                    IMAGE_LAYER_GZIP_MEDIA_TYPE,
                    IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
                    IMAGE_LAYER_MEDIA_TYPE,
                ],
            )
            .await
            .map_err(|e| RegistryError::PullFailed { reference: image.to_string(), reason: e.to_string() })?;

        info!(layers = image_data.layers.len(), "Image manifest fetched successfully");

        let config = parse_image_config(&image_data.config.data)?;
        let layers = image_data
            .layers
            .into_iter()
            .map(|layer| PulledLayer { media_type: layer.media_type, data: layer.data })
            .collect();

        Ok(PulledImage { reference: normalized, config, layers })
    }
}

/// Fills in the registry, namespace and tag Docker Hub references omit.
///
/// - `nginx` → `docker.io/library/nginx:latest`
/// - `myorg/app:1.0` → `docker.io/myorg/app:1.0`
/// - `ghcr.io/org/repo:tag` is left as is
pub fn normalize_reference(image: &str) -> String {
    let first = image.split('/').next().unwrap_or_default();
    let has_registry =
        image.contains('/') && (first.contains('.') || first.contains(':') || first == "localhost");

    let normalized = if has_registry {
        image.to_string()
    } else if image.contains('/') {
        format!("docker.io/{}", image)
    } else {
        format!("docker.io/library/{}", image)
    };

    // The last path component carries the tag; a registry port does not count
    let last = normalized.rsplit('/').next().unwrap_or_default();
    if last.contains(':') || last.contains('@') {
        normalized
    } else {
        format!("{}:latest", normalized)
    }
}

#[derive(Debug, Default, Deserialize)]
struct OciConfigFile {
    #[serde(default)]
    config: Option<OciContainerConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OciContainerConfig {
    #[serde(default)]
    env: Option<Vec<String>>,
    #[serde(default)]
    cmd: Option<Vec<String>>,
    #[serde(default)]
    entrypoint: Option<Vec<String>>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    stop_signal: Option<String>,
    #[serde(default)]
    shell: Option<Vec<String>>,
}

/// Maps an OCI image config blob onto [`ImageConfig`].
pub fn parse_image_config(data: &[u8]) -> Result<ImageConfig, RegistryError> {
    let file: OciConfigFile =
        serde_json::from_slice(data).map_err(|e| RegistryError::InvalidConfig(e.to_string()))?;
    let oci = file.config.unwrap_or_default();

    let mut config = ImageConfig::scratch();
    config.env = oci.env.unwrap_or_default();
    config.cmd = oci.cmd.unwrap_or_default();
    config.entrypoint = oci.entrypoint.unwrap_or_default();
    if let Some(dir) = oci.working_dir.filter(|d| !d.is_empty()) {
        config.workdir = dir;
    }
    config.user = oci.user.filter(|u| !u.is_empty());
    config.exposed_ports = oci.exposed_ports.unwrap_or_default().into_keys().collect();
    config.labels = oci.labels.unwrap_or_default();
    config.stop_signal = oci.stop_signal.filter(|s| !s.is_empty());
    if let Some(shell) = oci.shell.filter(|s| !s.is_empty()) {
        config.shell = shell;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_normalize_short_name() {
        assert_eq!(normalize_reference("nginx"), "docker.io/library/nginx:latest");
        assert_eq!(normalize_reference("python:3.8-slim"), "docker.io/library/python:3.8-slim");
    }

    #[test]
    fn test_normalize_with_org() {
        assert_eq!(normalize_reference("myorg/myapp"), "docker.io/myorg/myapp:latest");
    }

    #[test]
    fn test_normalize_fully_qualified() {
        assert_eq!(normalize_reference("ghcr.io/org/repo:v1.0.0"), "ghcr.io/org/repo:v1.0.0");
        assert_eq!(normalize_reference("localhost:5000/app"), "localhost:5000/app:latest");
    }

    #[test]
    fn test_normalized_reference_parses() {
        let reference = Reference::try_from(normalize_reference("nginx:1.25").as_str()).unwrap();
        assert_eq!(reference.registry(), "docker.io");
        assert_eq!(reference.repository(), "library/nginx");
        assert_eq!(reference.tag(), Some("1.25"));
    }

    #[test]
    fn test_parse_image_config() {
        let data = br#"{
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Env": ["PATH=/usr/local/bin:/usr/bin", "LANG=C.UTF-8"],
                "Cmd": ["python3"],
                "WorkingDir": "/srv",
                "User": "",
                "ExposedPorts": {"8080/tcp": {}},
                "Labels": {"maintainer": "ops"},
                "StopSignal": "SIGINT"
            }
        }"#;

        let config = parse_image_config(data).unwrap();
        assert_eq!(config.cmd, vec!["python3"]);
        assert_eq!(config.workdir, "/srv");
        assert_eq!(config.env_get("LANG"), Some("C.UTF-8"));
        assert!(config.user.is_none());
        assert!(config.exposed_ports.contains("8080/tcp"));
        assert_eq!(config.labels.get("maintainer").map(String::as_str), Some("ops"));
        assert_eq!(config.stop_signal.as_deref(), Some("SIGINT"));
    }

    #[test]
    fn test_parse_image_config_without_container_config() {
        let config = parse_image_config(br#"{"architecture": "amd64", "os": "linux"}"#).unwrap();
        assert_eq!(config, ImageConfig::scratch());
        assert!(parse_image_config(b"not json").is_err());
    }

    #[test]
    fn test_decode_gzip_and_plain_layers() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"tar bytes").unwrap();
        let compressed = encoder.finish().unwrap();

        let gzip = PulledLayer { media_type: IMAGE_LAYER_GZIP_MEDIA_TYPE.to_string(), data: compressed.clone() };
        assert_eq!(gzip.decode().unwrap(), b"tar bytes");

        // Some registries label gzip layers as plain tar
        let mislabeled = PulledLayer { media_type: IMAGE_LAYER_MEDIA_TYPE.to_string(), data: compressed };
        assert_eq!(mislabeled.decode().unwrap(), b"tar bytes");

        let plain = PulledLayer { media_type: IMAGE_LAYER_MEDIA_TYPE.to_string(), data: b"tar bytes".to_vec() };
        assert_eq!(plain.decode().unwrap(), b"tar bytes");

        let zstd = PulledLayer { media_type: "application/vnd.oci.image.layer.v1.tar+zstd".into(), data: vec![] };
        assert!(matches!(zstd.decode(), Err(RegistryError::UnsupportedLayer(_))));
    }
}
