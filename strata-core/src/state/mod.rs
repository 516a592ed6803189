//! State management with SQLite persistence.
//!
//! The StateManager is the image registry: built and pulled images, the
//! tags pointing at them, and which layer blobs each image references.
//! Layer bytes live in the blob store; only digests are kept here.

use crate::error::{Result, StrataError};
use crate::types::{Image, ImageReference};
use chrono::{TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{ConnectOptions, Row};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, instrument};

pub mod migrations;

#[cfg(test)]
mod tests;

/// A tag and the image it points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRecord {
    pub reference: ImageReference,
    pub image_id: String,
}

/// State manager for persistent storage.
#[derive(Clone)]
pub struct StateManager {
    pool: SqlitePool,
}

impl StateManager {
    /// Create a new StateManager with an in-memory database (for tests).
    pub async fn new_in_memory() -> Result<Self> {
        // Every connection to :memory: is a separate database
        Self::connect(":memory:", 1).await
    }

    /// Get a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a new StateManager with a database at the specified path.
    #[instrument(skip(db_path))]
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Initializing state manager at {:?}", db_path);

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| StrataError::InvalidConfig {
                reason: format!("Failed to create directory {}: {}", parent.display(), e),
            })?;
        }

        let path = db_path.to_str().ok_or_else(|| StrataError::InvalidConfig {
            reason: "Invalid database path".to_string(),
        })?;
        Self::connect(path, 5).await
    }

    async fn connect(path: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StrataError::DatabaseError(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(10))
            .log_statements(tracing::log::LevelFilter::Debug);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StrataError::DatabaseError(e.to_string()))?;

        let manager = Self { pool };
        manager.run_migrations().await?;

        info!("State manager initialized successfully");
        Ok(manager)
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        migrations::run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    // ========================
    // Image Operations
    // ========================

    /// Registers an image and, optionally, points a tag at it.
    ///
    /// Runs in one transaction: either the image and its tag are both
    /// visible afterwards or neither is. Registering an existing image
    /// only moves the tag.
    #[instrument(skip(self, image), fields(image_id = %image.id))]
    pub async fn register_image(&self, image: &Image, tag: Option<&ImageReference>) -> Result<()> {
        let to_json = |what: &str, value: serde_json::Result<String>| {
            value.map_err(|e| StrataError::DatabaseError(format!("Failed to serialize {}: {}", what, e)))
        };
        let config_json = to_json("config", serde_json::to_string(&image.config))?;
        let layers_json = to_json("layers", serde_json::to_string(&image.layers))?;
        let history_json = to_json("history", serde_json::to_string(&image.history))?;

        let mut tx = self.pool.begin().await.map_err(db_error("register_image"))?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO images (id, config, layers, history, parent, architecture, os, size_bytes, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&image.id)
        .bind(config_json)
        .bind(layers_json)
        .bind(history_json)
        .bind(&image.parent)
        .bind(&image.architecture)
        .bind(&image.os)
        .bind(image.size_bytes as i64)
        .bind(image.created_at.timestamp())
        .execute(&mut *tx)
        .await
        .map_err(db_error("register_image"))?
        .rows_affected();

        if inserted > 0 {
            for (position, layer) in image.layers.iter().enumerate() {
                sqlx::query("INSERT INTO image_layers (image_id, position, digest) VALUES (?, ?, ?)")
                    .bind(&image.id)
                    .bind(position as i64)
                    .bind(&layer.digest)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error("register_image"))?;
            }
        }

        if let Some(reference) = tag {
            sqlx::query(
                r#"
                INSERT INTO tags (name, tag, image_id, updated_at) VALUES (?, ?, ?, ?)
                ON CONFLICT(name, tag) DO UPDATE SET image_id = excluded.image_id, updated_at = excluded.updated_at
                "#,
            )
            .bind(&reference.name)
            .bind(&reference.tag)
            .bind(&image.id)
            .bind(Utc::now().timestamp())
            .execute(&mut *tx)
            .await
            .map_err(db_error("register_image"))?;
        }

        tx.commit().await.map_err(db_error("register_image"))?;

        info!(tag = ?tag.map(|t| t.to_string()), "Registered image {}", image.short_id());
        Ok(())
    }

    /// Get an image by ID (supports unambiguous prefixes like Docker).
    #[instrument(skip(self), fields(image_id = %id))]
    pub async fn get_image(&self, id: &str) -> Result<Image> {
        let row = sqlx::query("SELECT * FROM images WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get_image"))?;

        if let Some(row) = row {
            return self.row_to_image(row);
        }

        let hex = id.strip_prefix("sha256:").unwrap_or(id);
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StrataError::ImageNotFound { reference: id.to_string() });
        }

        let mut rows = sqlx::query("SELECT * FROM images WHERE id LIKE ? LIMIT 2")
            .bind(format!("sha256:{}%", hex))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("get_image"))?;

        if rows.len() > 1 {
            return Err(StrataError::InvalidReference {
                reference: id.to_string(),
                reason: "ID prefix matches more than one image".to_string(),
            });
        }
        match rows.pop() {
            Some(row) => self.row_to_image(row),
            None => Err(StrataError::ImageNotFound { reference: id.to_string() }),
        }
    }

    /// Get the image a tag points to.
    #[instrument(skip(self), fields(reference = %reference))]
    pub async fn get_image_by_tag(&self, reference: &ImageReference) -> Result<Image> {
        let row = sqlx::query(
            "SELECT images.* FROM images JOIN tags ON tags.image_id = images.id WHERE tags.name = ? AND tags.tag = ?",
        )
        .bind(&reference.name)
        .bind(&reference.tag)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get_image_by_tag"))?
        .ok_or_else(|| StrataError::ImageNotFound { reference: reference.to_string() })?;

        self.row_to_image(row)
    }

    /// Resolves a user-supplied reference: a tag first, then an image ID.
    pub async fn resolve_image(&self, reference: &str) -> Result<Image> {
        if let Ok(parsed) = ImageReference::parse(reference) {
            match self.get_image_by_tag(&parsed).await {
                Ok(image) => return Ok(image),
                Err(StrataError::ImageNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.get_image(reference).await.map_err(|e| match e {
            StrataError::ImageNotFound { .. } => StrataError::ImageNotFound { reference: reference.to_string() },
            other => other,
        })
    }

    /// List all images, newest first.
    #[instrument(skip(self))]
    pub async fn list_images(&self) -> Result<Vec<Image>> {
        let rows = sqlx::query("SELECT * FROM images ORDER BY created_at DESC, id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list_images"))?;

        rows.into_iter().map(|row| self.row_to_image(row)).collect()
    }

    /// List all tags, sorted by reference.
    pub async fn list_tags(&self) -> Result<Vec<TagRecord>> {
        let rows = sqlx::query("SELECT name, tag, image_id FROM tags ORDER BY name, tag")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list_tags"))?;

        Ok(rows.into_iter().map(row_to_tag).collect())
    }

    /// Tags pointing at one image.
    pub async fn tags_for(&self, image_id: &str) -> Result<Vec<ImageReference>> {
        let rows = sqlx::query("SELECT name, tag, image_id FROM tags WHERE image_id = ? ORDER BY name, tag")
            .bind(image_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("tags_for"))?;

        Ok(rows.into_iter().map(|row| row_to_tag(row).reference).collect())
    }

    /// Removes a tag. Returns the image it pointed to.
    #[instrument(skip(self), fields(reference = %reference))]
    pub async fn remove_tag(&self, reference: &ImageReference) -> Result<String> {
        let image_id: Option<String> = sqlx::query_scalar("DELETE FROM tags WHERE name = ? AND tag = ? RETURNING image_id")
            .bind(&reference.name)
            .bind(&reference.tag)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("remove_tag"))?;

        image_id.ok_or_else(|| StrataError::ImageNotFound { reference: reference.to_string() })
    }

    /// Delete an image together with its tags and layer references.
    #[instrument(skip(self), fields(image_id = %id))]
    pub async fn delete_image(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_error("delete_image"))?;
        for statement in [
            "DELETE FROM tags WHERE image_id = ?",
            "DELETE FROM image_layers WHERE image_id = ?",
            "DELETE FROM images WHERE id = ?",
        ] {
            sqlx::query(statement)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_error("delete_image"))?;
        }
        tx.commit().await.map_err(db_error("delete_image"))?;

        Ok(())
    }

    /// Every layer digest referenced by a registered image.
    pub async fn referenced_layers(&self) -> Result<HashSet<String>> {
        let digests: Vec<String> = sqlx::query_scalar("SELECT DISTINCT digest FROM image_layers")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("referenced_layers"))?;

        Ok(digests.into_iter().collect())
    }

    fn row_to_image(&self, row: sqlx::sqlite::SqliteRow) -> Result<Image> {
        let id: String = row.get("id");
        let invalid = |what: &str, e: serde_json::Error| StrataError::InvalidImage {
            id: id.clone(),
            reason: format!("Failed to deserialize {}: {}", what, e),
        };

        let config = serde_json::from_str(&row.get::<String, _>("config")).map_err(|e| invalid("config", e))?;
        let layers = serde_json::from_str(&row.get::<String, _>("layers")).map_err(|e| invalid("layers", e))?;
        let history = serde_json::from_str(&row.get::<String, _>("history")).map_err(|e| invalid("history", e))?;

        let created_at_secs: i64 = row.get("created_at");
        let size_bytes: i64 = row.get("size_bytes");

        Ok(Image {
            id: id.clone(),
            config,
            layers,
            history,
            parent: row.get("parent"),
            architecture: row.get("architecture"),
            os: row.get("os"),
            size_bytes: size_bytes as u64,
            created_at: Utc.timestamp_opt(created_at_secs, 0).single().unwrap_or_default(),
        })
    }
}

fn row_to_tag(row: sqlx::sqlite::SqliteRow) -> TagRecord {
    TagRecord {
        reference: ImageReference { name: row.get("name"), tag: row.get("tag"), digest: None },
        image_id: row.get("image_id"),
    }
}

fn db_error(operation: &'static str) -> impl Fn(sqlx::Error) -> StrataError {
    move |e| {
        metrics::counter!("strata_db_errors_total", "operation" => operation).increment(1);
        StrataError::DatabaseError(e.to_string())
    }
}
