//! Image domain types.

use crate::error::{Result, StrataError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Tag used when a reference does not name one.
pub const DEFAULT_TAG: &str = "latest";

/// PATH given to processes when the image does not define one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// An immutable, built image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    /// Image ID (`sha256:<hex>` of config and layer digests)
    pub id: String,

    /// Default process settings and metadata
    pub config: ImageConfig,

    /// Ordered layer stack, base first
    pub layers: Vec<LayerDescriptor>,

    /// One entry per build step, including metadata-only steps
    #[serde(default)]
    pub history: Vec<LayerHistory>,

    /// Reference the image was built from (`FROM`), if any
    #[serde(default)]
    pub parent: Option<String>,

    /// Image architecture (x86_64, aarch64)
    pub architecture: String,

    /// Operating system (linux)
    pub os: String,

    /// Total size of all layers in bytes
    pub size_bytes: u64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Image {
    /// Assembles an image and derives its content-addressed ID.
    pub fn new(
        config: ImageConfig,
        layers: Vec<LayerDescriptor>,
        history: Vec<LayerHistory>,
        parent: Option<String>,
    ) -> Self {
        let architecture = std::env::consts::ARCH.to_string();
        let os = "linux".to_string();
        let id = compute_image_id(&config, &layers, &architecture, &os);
        let size_bytes = layers.iter().map(|l| l.size).sum();

        Self {
            id,
            config,
            layers,
            history,
            parent,
            architecture,
            os,
            size_bytes,
            created_at: Utc::now(),
        }
    }

    /// First 12 hex characters of the ID.
    pub fn short_id(&self) -> &str {
        short_digest(&self.id)
    }

    /// Recomputes the ID from the content and checks it matches.
    pub fn verify_id(&self) -> bool {
        compute_image_id(&self.config, &self.layers, &self.architecture, &self.os) == self.id
    }
}

/// Image ID over everything that affects runtime behavior; timestamps excluded.
fn compute_image_id(
    config: &ImageConfig,
    layers: &[LayerDescriptor],
    architecture: &str,
    os: &str,
) -> String {
    #[derive(Serialize)]
    struct IdInput<'a> {
        architecture: &'a str,
        os: &'a str,
        config: &'a ImageConfig,
        layers: Vec<&'a str>,
    }

    let input = IdInput {
        architecture,
        os,
        config,
        layers: layers.iter().map(|l| l.digest.as_str()).collect(),
    };

    // Serializing plain structs, Vecs and BTreeMaps cannot fail.
    let canonical = serde_json::to_vec(&input).unwrap_or_default();
    format!("sha256:{:x}", Sha256::digest(&canonical))
}

/// Strips an algorithm prefix and shortens a digest for display.
pub fn short_digest(digest: &str) -> &str {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    &hex[..12.min(hex.len())]
}

/// Image configuration: how a container from this image is launched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Working directory (absolute, inside the image)
    pub workdir: String,

    /// Entrypoint argv
    #[serde(default)]
    pub entrypoint: Vec<String>,

    /// Default command argv (arguments to the entrypoint if one is set)
    #[serde(default)]
    pub cmd: Vec<String>,

    /// Environment as `KEY=VALUE`, in declaration order
    #[serde(default)]
    pub env: Vec<String>,

    /// User to run as (e.g., "app", "1000", "1000:1000")
    #[serde(default)]
    pub user: Option<String>,

    /// Exposed ports (e.g., "8080/tcp")
    #[serde(default)]
    pub exposed_ports: BTreeSet<String>,

    /// Labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Signal sent to stop the container
    #[serde(default)]
    pub stop_signal: Option<String>,

    /// Shell used for shell-form commands
    #[serde(default)]
    pub shell: Vec<String>,
}

impl ImageConfig {
    /// Configuration of an empty (`scratch`) image.
    pub fn scratch() -> Self {
        Self { workdir: "/".to_string(), shell: default_shell(), ..Default::default() }
    }

    /// The argv a container runs when started without an override.
    pub fn default_argv(&self) -> Vec<String> {
        self.entrypoint.iter().chain(self.cmd.iter()).cloned().collect()
    }

    /// Looks up an environment variable.
    pub fn env_get(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|kv| {
            let (k, v) = kv.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// Sets an environment variable, replacing an earlier value in place.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let entry = format!("{}={}", key, value);
        let prefix = format!("{}=", key);
        match self.env.iter_mut().find(|kv| kv.starts_with(&prefix)) {
            Some(existing) => *existing = entry,
            None => self.env.push(entry),
        }
    }

    /// Environment as pairs, with a default PATH when the image has none.
    pub fn process_env(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .env
            .iter()
            .filter_map(|kv| kv.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
            .collect();
        if !pairs.iter().any(|(k, _)| k == "PATH") {
            pairs.push(("PATH".to_string(), DEFAULT_PATH.to_string()));
        }
        pairs
    }

    /// The shell for shell-form commands.
    pub fn shell_or_default(&self) -> Vec<String> {
        if self.shell.is_empty() {
            default_shell()
        } else {
            self.shell.clone()
        }
    }
}

/// `/bin/sh -c`
pub fn default_shell() -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string()]
}

/// One layer in an image's stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    /// `sha256:<hex>` of the uncompressed layer tarball
    pub digest: String,

    /// Tarball size in bytes
    pub size: u64,

    /// Instruction that produced the layer
    pub created_by: String,
}

/// Layer history entry (similar to Docker history).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerHistory {
    /// Instruction as written in the Dockerfile
    pub created_by: String,

    /// Layer digest, absent for empty layers
    #[serde(default)]
    pub digest: Option<String>,

    /// Layer size in bytes (0 for empty layers)
    pub size_bytes: u64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Comment (e.g. "cached")
    #[serde(default)]
    pub comment: String,

    /// True if this step adds no files (e.g., ENV, LABEL)
    #[serde(default)]
    pub empty_layer: bool,
}

/// A parsed `name[:tag][@digest]` image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    pub name: String,
    pub tag: String,
    #[serde(default)]
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parses a reference, defaulting the tag to `latest`.
    ///
    /// A `:` only starts a tag when it follows the last `/`, so registry
    /// ports (`localhost:5000/app`) are kept in the name.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |reason: &str| StrataError::InvalidReference {
            reference: s.to_string(),
            reason: reason.to_string(),
        };

        let s = s.trim();
        if s.is_empty() {
            return Err(invalid("reference is empty"));
        }

        let (name_tag, digest) = match s.split_once('@') {
            Some((nt, d)) => {
                if !d.starts_with("sha256:") || d.len() != 71 {
                    return Err(invalid("digest must be sha256:<64 hex chars>"));
                }
                (nt, Some(d.to_string()))
            }
            None => (s, None),
        };

        let last_slash = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(idx) => {
                let idx = last_slash + idx;
                (&name_tag[..idx], name_tag[idx + 1..].to_string())
            }
            None => (name_tag, DEFAULT_TAG.to_string()),
        };

        if name.is_empty() {
            return Err(invalid("name is empty"));
        }
        if !name.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-' | '/' | ':')
        }) {
            return Err(invalid("name may only contain lowercase letters, digits, '.', '_', '-', '/'"));
        }
        if tag.is_empty()
            || tag.len() > 128
            || !tag.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(invalid("tag must be 1-128 characters of [A-Za-z0-9_.-]"));
        }

        Ok(Self { name: name.to_string(), tag, digest })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(digest: &str) -> LayerDescriptor {
        LayerDescriptor { digest: digest.to_string(), size: 10, created_by: "COPY . .".into() }
    }

    #[test]
    fn test_parse_reference_defaults_tag() {
        let r = ImageReference::parse("python").unwrap();
        assert_eq!(r.name, "python");
        assert_eq!(r.tag, "latest");
        assert_eq!(r.to_string(), "python:latest");
    }

    #[test]
    fn test_parse_reference_with_tag() {
        let r = ImageReference::parse("python:3.8-slim").unwrap();
        assert_eq!(r.name, "python");
        assert_eq!(r.tag, "3.8-slim");
    }

    #[test]
    fn test_parse_reference_registry_port() {
        let r = ImageReference::parse("localhost:5000/team/app").unwrap();
        assert_eq!(r.name, "localhost:5000/team/app");
        assert_eq!(r.tag, "latest");

        let r = ImageReference::parse("localhost:5000/team/app:v2").unwrap();
        assert_eq!(r.name, "localhost:5000/team/app");
        assert_eq!(r.tag, "v2");
    }

    #[test]
    fn test_parse_reference_rejects_garbage() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("MyApp").is_err());
        assert!(ImageReference::parse("app:").is_err());
        assert!(ImageReference::parse("app@md5:abc").is_err());
    }

    #[test]
    fn test_image_id_is_content_addressed() {
        let config = ImageConfig { cmd: vec!["python".into(), "main.py".into()], ..ImageConfig::scratch() };
        let a = Image::new(config.clone(), vec![layer("sha256:aa")], vec![], None);
        let b = Image::new(config.clone(), vec![layer("sha256:aa")], vec![], None);
        let c = Image::new(config, vec![layer("sha256:bb")], vec![], None);

        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert!(a.id.starts_with("sha256:"));
        assert!(a.verify_id());
        assert_eq!(a.short_id().len(), 12);
    }

    #[test]
    fn test_default_argv_joins_entrypoint_and_cmd() {
        let config = ImageConfig {
            entrypoint: vec!["python".into()],
            cmd: vec!["main.py".into()],
            ..ImageConfig::scratch()
        };
        assert_eq!(config.default_argv(), vec!["python", "main.py"]);
    }

    #[test]
    fn test_set_env_replaces_in_place() {
        let mut config = ImageConfig::scratch();
        config.set_env("A", "1");
        config.set_env("B", "2");
        config.set_env("A", "3");
        assert_eq!(config.env, vec!["A=3", "B=2"]);
        assert_eq!(config.env_get("A"), Some("3"));
        assert_eq!(config.env_get("C"), None);
    }

    #[test]
    fn test_process_env_adds_default_path() {
        let config = ImageConfig::scratch();
        let env = config.process_env();
        assert!(env.iter().any(|(k, v)| k == "PATH" && v == DEFAULT_PATH));
    }
}
