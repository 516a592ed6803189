//! Base image resolution.
//!
//! `FROM` names a local image (tag or ID), `scratch`, or something to pull.
//! Pulled images are stored and tagged like any built image, so the next
//! build finds them locally.

use crate::builder::executor::BuildError;
use crate::builder::oci::{OciRegistry, Registry};
use crate::config::PullPolicy;
use crate::error::StrataError;
use crate::store::ImageStore;
use crate::types::{Image, ImageConfig, ImageReference, LayerDescriptor, LayerHistory};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// The empty base image.
pub const SCRATCH: &str = "scratch";

/// A base image ready to build on.
#[derive(Debug, Clone)]
pub struct ResolvedBase {
    /// Reference as written in FROM (after ARG expansion)
    pub reference: String,
    /// Image ID; `scratch` for the empty image
    pub image_id: String,
    pub config: ImageConfig,
    pub layers: Vec<LayerDescriptor>,
    pub history: Vec<LayerHistory>,
    /// True if the image was fetched from a registry for this build
    pub pulled: bool,
}

impl ResolvedBase {
    pub fn scratch() -> Self {
        Self {
            reference: SCRATCH.to_string(),
            image_id: SCRATCH.to_string(),
            config: ImageConfig::scratch(),
            layers: Vec::new(),
            history: Vec::new(),
            pulled: false,
        }
    }

    fn from_image(reference: &str, image: Image, pulled: bool) -> Self {
        Self {
            reference: reference.to_string(),
            image_id: image.id,
            config: image.config,
            layers: image.layers,
            history: image.history,
            pulled,
        }
    }

    pub fn is_scratch(&self) -> bool {
        self.image_id == SCRATCH
    }
}

/// Turns a FROM reference into a base image.
#[async_trait]
pub trait BaseImageResolver: Send + Sync {
    async fn resolve(&self, reference: &str, platform: Option<&str>) -> Result<ResolvedBase, BuildError>;
}

/// Resolves against the local image store, pulling per the pull policy.
pub struct StoreResolver {
    store: ImageStore,
    policy: PullPolicy,
    registry: Arc<dyn Registry>,
}

impl StoreResolver {
    pub fn new(store: ImageStore, policy: PullPolicy) -> Self {
        Self::with_registry(store, policy, Arc::new(OciRegistry::new()))
    }

    pub fn with_registry(store: ImageStore, policy: PullPolicy, registry: Arc<dyn Registry>) -> Self {
        Self { store, policy, registry }
    }

    async fn local(&self, reference: &str) -> Result<Option<Image>, BuildError> {
        match self.store.resolve(reference).await {
            Ok(image) => Ok(Some(image)),
            Err(StrataError::ImageNotFound { .. }) | Err(StrataError::InvalidReference { .. }) => Ok(None),
            Err(e) => Err(BuildError::Store(e)),
        }
    }

    #[instrument(skip(self))]
    async fn pull(&self, reference: &str, platform: Option<&str>) -> Result<Image, BuildError> {
        let unresolvable = |reason: String| BuildError::BaseImageUnresolvable { reference: reference.to_string(), reason };

        let tag = ImageReference::parse(reference).map_err(|e| unresolvable(e.to_string()))?;
        let pulled = self.registry.pull(reference, platform).await.map_err(|e| unresolvable(e.to_string()))?;

        let created_by = format!("pulled from {}", pulled.reference);
        let mut layers = Vec::with_capacity(pulled.layers.len());
        let mut history = Vec::with_capacity(pulled.layers.len());
        for layer in &pulled.layers {
            let tar = layer.decode().map_err(|e| unresolvable(e.to_string()))?;
            let info = self.store.blobs().ingest(tar.as_slice())?;
            debug!(digest = %info.digest, size = info.size, "Stored pulled layer");

            history.push(LayerHistory {
                created_by: created_by.clone(),
                digest: Some(info.digest.clone()),
                size_bytes: info.size,
                created_at: Utc::now(),
                comment: String::new(),
                empty_layer: false,
            });
            layers.push(LayerDescriptor { digest: info.digest, size: info.size, created_by: created_by.clone() });
        }

        let image = Image::new(pulled.config, layers, history, None);
        self.store.publish(&image, Some(&tag)).await?;
        info!(image_id = %image.short_id(), "Pulled base image");
        Ok(image)
    }
}

#[async_trait]
impl BaseImageResolver for StoreResolver {
    async fn resolve(&self, reference: &str, platform: Option<&str>) -> Result<ResolvedBase, BuildError> {
        if reference == SCRATCH {
            return Ok(ResolvedBase::scratch());
        }

        let local = match self.policy {
            PullPolicy::Always => None,
            PullPolicy::Missing | PullPolicy::Never => self.local(reference).await?,
        };
        if let Some(image) = local {
            debug!(reference, image_id = %image.short_id(), "Using local base image");
            return Ok(ResolvedBase::from_image(reference, image, false));
        }

        if self.policy == PullPolicy::Never {
            return Err(BuildError::BaseImageUnresolvable {
                reference: reference.to_string(),
                reason: "not in the local store and pulling is disabled".to_string(),
            });
        }

        let image = self.pull(reference, platform).await?;
        Ok(ResolvedBase::from_image(reference, image, true))
    }
}
