//! Database migrations.

use crate::error::{Result, StrataError};
use sqlx::SqlitePool;
use tracing::{info, instrument};

const SCHEMA_VERSION: i64 = 2;

#[instrument(skip(pool))]
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StrataError::MigrationFailed { reason: e.to_string() })?;

    let current_version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(pool)
            .await
            .map_err(|e| StrataError::MigrationFailed { reason: e.to_string() })?;

    let current_version = current_version.unwrap_or(0);

    if current_version >= SCHEMA_VERSION {
        info!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    info!("Migrating database from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        migrate_to_v1(pool).await?;
    }

    if current_version < 2 {
        migrate_to_v2(pool).await?;
    }

    Ok(())
}

/// Images and their tags.
#[instrument(skip(pool))]
async fn migrate_to_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 1");

    let mut tx = pool.begin().await.map_err(|e| StrataError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS images (
            id TEXT PRIMARY KEY,
            config TEXT NOT NULL,
            layers TEXT NOT NULL,
            history TEXT NOT NULL,
            parent TEXT,
            architecture TEXT NOT NULL,
            os TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| StrataError::MigrationFailed { reason: format!("Failed to create images table: {}", e) })?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tags (
            name TEXT NOT NULL,
            tag TEXT NOT NULL,
            image_id TEXT NOT NULL REFERENCES images(id) ON DELETE CASCADE,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (name, tag)
        )
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| StrataError::MigrationFailed { reason: format!("Failed to create tags table: {}", e) })?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tags_image_id ON tags(image_id)")
        .execute(&mut *tx)
        .await
        .map_err(|e| StrataError::MigrationFailed { reason: e.to_string() })?;

    set_version(&mut tx, 1).await?;
    tx.commit().await.map_err(|e| StrataError::MigrationFailed { reason: e.to_string() })?;

    info!("Migration to schema version 1 complete");
    Ok(())
}

/// Layer references, for blob garbage collection.
#[instrument(skip(pool))]
async fn migrate_to_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 2");

    let mut tx = pool.begin().await.map_err(|e| StrataError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS image_layers (
            image_id TEXT NOT NULL REFERENCES images(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            digest TEXT NOT NULL,
            PRIMARY KEY (image_id, position)
        )
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| StrataError::MigrationFailed { reason: format!("Failed to create image_layers table: {}", e) })?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_image_layers_digest ON image_layers(digest)")
        .execute(&mut *tx)
        .await
        .map_err(|e| StrataError::MigrationFailed { reason: e.to_string() })?;

    set_version(&mut tx, 2).await?;
    tx.commit().await.map_err(|e| StrataError::MigrationFailed { reason: e.to_string() })?;

    info!("Migration to schema version 2 complete");
    Ok(())
}

async fn set_version(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, version: i64) -> Result<()> {
    sqlx::query("DELETE FROM schema_version")
        .execute(&mut **tx)
        .await
        .map_err(|e| StrataError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(&mut **tx)
        .await
        .map_err(|e| StrataError::MigrationFailed { reason: e.to_string() })?;

    Ok(())
}
