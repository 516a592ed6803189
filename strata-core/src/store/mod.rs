//! Image storage: layer blobs plus the image registry.
//!
//! Publishing is ordered so a crash never leaves a registered image with
//! missing layers: blobs are written first (content addressed, so an
//! orphan is harmless and collected later), then the image and its tag are
//! registered in one database transaction.

use crate::builder::layer::apply_layer_from;
use crate::error::{Result, StrataError};
use crate::state::StateManager;
use crate::types::{Image, ImageReference};
use std::path::Path;
use tracing::{debug, info, instrument};

pub mod blobs;

pub use blobs::{BlobInfo, BlobStore};

/// What `remove` did.
#[derive(Debug, Default)]
pub struct RemoveOutcome {
    pub untagged: Vec<ImageReference>,
    /// ID of the image deleted, if its last tag went
    pub deleted: Option<String>,
    pub blobs_removed: usize,
}

/// Blob store and image registry under one data directory.
#[derive(Clone)]
pub struct ImageStore {
    blobs: BlobStore,
    state: StateManager,
}

impl ImageStore {
    /// Opens a store rooted at `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let blobs = BlobStore::new(&data_dir.join("blobs"))?;
        let state = StateManager::new(data_dir.join("strata.db")).await?;
        Ok(Self::with_parts(blobs, state))
    }

    pub fn with_parts(blobs: BlobStore, state: StateManager) -> Self {
        Self { blobs, state }
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    /// Registers an image whose layers are already in the blob store.
    #[instrument(skip(self, image), fields(image_id = %image.short_id()))]
    pub async fn publish(&self, image: &Image, tag: Option<&ImageReference>) -> Result<()> {
        for layer in &image.layers {
            if !self.blobs.contains(&layer.digest) {
                return Err(StrataError::BlobNotFound { digest: layer.digest.clone() });
            }
        }
        self.state.register_image(image, tag).await
    }

    /// Looks up an image by tag or ID.
    pub async fn resolve(&self, reference: &str) -> Result<Image> {
        self.state.resolve_image(reference).await
    }

    /// Unpacks an image's layers, in order, into `dest`.
    #[instrument(skip(self, image), fields(image_id = %image.short_id()))]
    pub fn materialize(&self, image: &Image, dest: &Path) -> Result<()> {
        std::fs::create_dir_all(dest).map_err(|e| StrataError::io(dest, e))?;
        for layer in &image.layers {
            self.apply_layer(&layer.digest, dest)?;
        }
        info!(layers = image.layers.len(), rootfs = %dest.display(), "Materialized image");
        Ok(())
    }

    /// Applies one stored layer on top of `rootfs`.
    pub fn apply_layer(&self, digest: &str, rootfs: &Path) -> Result<()> {
        debug!(digest = %digest, "Applying layer");
        let file = self.blobs.open(digest)?;
        apply_layer_from(std::io::BufReader::new(file), rootfs, digest)
    }

    /// Removes a tag, or an image by ID.
    ///
    /// An image is deleted once no tag points at it. Deleting a tagged
    /// image by ID requires `force`, which also drops its tags. Blobs no
    /// image references any more are collected afterwards.
    #[instrument(skip(self))]
    pub async fn remove(&self, reference: &str, force: bool) -> Result<RemoveOutcome> {
        let mut outcome = RemoveOutcome::default();

        let tagged = match ImageReference::parse(reference) {
            Ok(parsed) => match self.state.remove_tag(&parsed).await {
                Ok(image_id) => Some((parsed, image_id)),
                Err(StrataError::ImageNotFound { .. }) => None,
                Err(e) => return Err(e),
            },
            Err(_) => None,
        };

        let image_id = match tagged {
            Some((parsed, image_id)) => {
                outcome.untagged.push(parsed);
                if !self.state.tags_for(&image_id).await?.is_empty() {
                    return Ok(outcome);
                }
                image_id
            }
            None => {
                let image = self.state.get_image(reference).await.map_err(|e| match e {
                    StrataError::ImageNotFound { .. } => StrataError::ImageNotFound { reference: reference.to_string() },
                    other => other,
                })?;
                let tags = self.state.tags_for(&image.id).await?;
                if !tags.is_empty() && !force {
                    return Err(StrataError::InvalidReference {
                        reference: reference.to_string(),
                        reason: format!(
                            "image is tagged as {}; remove the tags or use --force",
                            tags.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ")
                        ),
                    });
                }
                outcome.untagged.extend(tags);
                image.id
            }
        };

        self.state.delete_image(&image_id).await?;
        outcome.deleted = Some(image_id);
        outcome.blobs_removed = self.gc().await?;
        Ok(outcome)
    }

    /// Deletes blobs no registered image references.
    pub async fn gc(&self) -> Result<usize> {
        let referenced = self.state.referenced_layers().await?;
        self.blobs.gc(&referenced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::layer::{LayerWriter, Owner};
    use crate::types::{ImageConfig, LayerDescriptor};
    use tempfile::TempDir;

    async fn store(temp: &TempDir) -> ImageStore {
        let blobs = BlobStore::new(&temp.path().join("blobs")).unwrap();
        ImageStore::with_parts(blobs, StateManager::new_in_memory().await.unwrap())
    }

    fn layer(store: &ImageStore, temp: &TempDir, path: &str, content: &str) -> LayerDescriptor {
        let mut writer = LayerWriter::new(&temp.path().join("tmp"));
        writer.add_bytes(path, content.as_bytes().to_vec(), 0o644, Owner::default());
        let blob = writer.finish().unwrap();
        let info = store.blobs().import_file(blob.file.path(), &blob.digest).unwrap();
        LayerDescriptor { digest: info.digest, size: info.size, created_by: format!("COPY {}", path) }
    }

    #[tokio::test]
    async fn test_publish_requires_blobs() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp).await;
        let missing = LayerDescriptor { digest: "sha256:00".into(), size: 1, created_by: "RUN x".into() };
        let image = Image::new(ImageConfig::scratch(), vec![missing], vec![], None);

        assert!(matches!(store.publish(&image, None).await, Err(StrataError::BlobNotFound { .. })));
        assert!(store.state().list_images().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_materialize_applies_layers_in_order() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp).await;
        let first = layer(&store, &temp, "app/main.py", "v1");
        let second = layer(&store, &temp, "app/main.py", "v2");
        let image = Image::new(ImageConfig::scratch(), vec![first, second], vec![], None);
        store.publish(&image, Some(&ImageReference::parse("app").unwrap())).await.unwrap();

        let rootfs = temp.path().join("rootfs");
        store.materialize(&store.resolve("app").await.unwrap(), &rootfs).unwrap();
        assert_eq!(std::fs::read_to_string(rootfs.join("app/main.py")).unwrap(), "v2");
    }

    #[tokio::test]
    async fn test_remove_last_tag_deletes_image_and_blobs() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp).await;
        let shared = layer(&store, &temp, "shared.txt", "shared");
        let own = layer(&store, &temp, "own.txt", "own");

        let keep = Image::new(ImageConfig::scratch(), vec![shared.clone()], vec![], None);
        let dropped = Image::new(ImageConfig::scratch(), vec![shared.clone(), own.clone()], vec![], None);
        store.publish(&keep, Some(&ImageReference::parse("keep").unwrap())).await.unwrap();
        store.publish(&dropped, Some(&ImageReference::parse("drop:v1").unwrap())).await.unwrap();
        store.publish(&dropped, Some(&ImageReference::parse("drop:v2").unwrap())).await.unwrap();

        let first = store.remove("drop:v1", false).await.unwrap();
        assert_eq!(first.untagged.len(), 1);
        assert!(first.deleted.is_none());

        let second = store.remove("drop:v2", false).await.unwrap();
        assert_eq!(second.deleted.as_deref(), Some(dropped.id.as_str()));
        assert_eq!(second.blobs_removed, 1);
        assert!(store.blobs().contains(&shared.digest));
        assert!(!store.blobs().contains(&own.digest));
    }

    #[tokio::test]
    async fn test_remove_tagged_image_by_id_needs_force() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp).await;
        let image = Image::new(ImageConfig::scratch(), vec![layer(&store, &temp, "a", "a")], vec![], None);
        store.publish(&image, Some(&ImageReference::parse("app").unwrap())).await.unwrap();

        assert!(matches!(
            store.remove(&image.id, false).await,
            Err(StrataError::InvalidReference { .. })
        ));

        let outcome = store.remove(image.short_id(), true).await.unwrap();
        assert_eq!(outcome.deleted.as_deref(), Some(image.id.as_str()));
        assert_eq!(outcome.untagged.len(), 1);
        assert!(store.resolve("app").await.is_err());
    }
}
