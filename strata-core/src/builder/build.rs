//! Centralized image building API for Strata.
//!
//! Wires the store, cache, registry and process runner together from a
//! [`Config`] so callers only supply a context directory and build options.

use crate::builder::base::StoreResolver;
use crate::builder::cache::LayerCache;
use crate::builder::context::BuildContext;
use crate::builder::executor::{BuildError, BuildOptions, BuildReport, BuildResult, Builder};
use crate::builder::parser::parse_dockerfile;
use crate::builder::runner::ProcessRunner;
use crate::config::Config;
use crate::events::EventBus;
use crate::store::ImageStore;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Creates a [`Builder`] backed by the data directory in `config`.
pub async fn open_builder(config: &Config, events: EventBus) -> BuildResult<Builder> {
    let store = ImageStore::open(&config.data_path()).await?;
    let cache = Arc::new(LayerCache::with_config(config.cache_path(), config.cache_size_limit_bytes)?);
    let resolver = Arc::new(StoreResolver::new(store.clone(), config.pull_policy));
    let runner = Arc::new(ProcessRunner::new(config.isolation));

    debug!(isolation = ?runner.isolation(), data_dir = %config.data_dir, "Opened builder");
    Ok(Builder::new(store, cache, resolver, runner, config.builds_path()).with_events(events))
}

/// Builds an image from `options.context_dir` and publishes it.
///
/// A step timeout in `options` wins over the configured one.
#[instrument(skip_all, fields(context = %options.context_dir.display(), tag = ?options.tag))]
pub async fn build_image(options: BuildOptions, config: &Config, events: EventBus) -> BuildResult<BuildReport> {
    let context_dir = options
        .context_dir
        .canonicalize()
        .map_err(|source| BuildError::Io { path: options.context_dir.clone(), source })?;

    let dockerfile_path = match &options.dockerfile {
        Some(path) if path.is_absolute() => path.clone(),
        Some(path) => context_dir.join(path),
        None => context_dir.join("Dockerfile"),
    };
    let content = std::fs::read_to_string(&dockerfile_path)
        .map_err(|source| BuildError::Io { path: dockerfile_path.clone(), source })?;

    debug!("Parsing Dockerfile: {:?}", dockerfile_path);
    let dockerfile = parse_dockerfile(&content)?;
    info!(steps = dockerfile.steps.len(), base = %dockerfile.base_image(), "Parsed Dockerfile");

    let context = BuildContext::open(&context_dir)?;
    let options = BuildOptions {
        context_dir,
        dockerfile: Some(dockerfile_path),
        step_timeout: options.step_timeout.or_else(|| config.step_timeout()),
        ..options
    };

    let builder = open_builder(config, events).await?;
    builder.build(&dockerfile, &context, &options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Isolation, PullPolicy};
    use tempfile::TempDir;

    fn config(temp: &TempDir) -> Config {
        Config {
            data_dir: temp.path().join("data").to_string_lossy().to_string(),
            isolation: Isolation::Host,
            pull_policy: PullPolicy::Never,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_build_image_from_context_dir() {
        let temp = TempDir::new().unwrap();
        let ctx = temp.path().join("ctx");
        std::fs::create_dir_all(&ctx).unwrap();
        std::fs::write(ctx.join("Dockerfile"), "FROM scratch\nCOPY hello.txt /hello.txt\nCMD [\"/hello\"]\n").unwrap();
        std::fs::write(ctx.join("hello.txt"), "hello").unwrap();

        let options = BuildOptions { tag: Some("hello:v1".into()), ..BuildOptions::new(&ctx) };
        let report = build_image(options, &config(&temp), EventBus::new()).await.unwrap();

        assert_eq!(report.image.layers.len(), 1);
        assert_eq!(report.tag.as_ref().map(|t| t.to_string()).as_deref(), Some("hello:v1"));

        let store = ImageStore::open(&temp.path().join("data")).await.unwrap();
        assert_eq!(store.resolve("hello:v1").await.unwrap().id, report.image.id);
    }

    #[tokio::test]
    async fn test_missing_dockerfile_is_io_error() {
        let temp = TempDir::new().unwrap();
        let err = build_image(BuildOptions::new(temp.path()), &config(&temp), EventBus::new()).await.unwrap_err();
        assert!(matches!(err, BuildError::Io { .. }));
        assert_eq!(err.exit_code(), 74);
    }

    #[tokio::test]
    async fn test_syntax_error_maps_to_parse() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("Dockerfile"), "FROM scratch\nFROBNICATE everything\n").unwrap();

        let err = build_image(BuildOptions::new(temp.path()), &config(&temp), EventBus::new()).await.unwrap_err();
        assert!(matches!(err, BuildError::Parse(_)));
        assert_eq!(err.exit_code(), 65);
    }
}
