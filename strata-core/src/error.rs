//! Error types for Strata.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.
//! Build failures have their own taxonomy in [`crate::builder::BuildError`].

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Strata operations.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Main error type for Strata.
#[derive(Error, Debug)]
pub enum StrataError {
    // Image errors
    #[error("Image not found: {reference}")]
    ImageNotFound { reference: String },

    #[error("Invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("Invalid image record {id}: {reason}")]
    InvalidImage { id: String, reason: String },

    #[error("Blob not found: {digest}")]
    BlobNotFound { digest: String },

    #[error("Blob {digest} is corrupt: content hashes to {actual}")]
    BlobCorrupt { digest: String, actual: String },

    // Container errors
    #[error("Container {id} cannot {action} while {state}")]
    InvalidContainerState { id: String, action: String, state: String },

    #[error("Container {id} has no command to run")]
    NoCommand { id: String },

    #[error("Failed to start container {id}: {reason}")]
    ContainerStartFailed { id: String, reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Layer {digest} could not be applied: {reason}")]
    LayerApplyFailed { digest: String, reason: String },

    // Database errors
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Database migration failed: {reason}")]
    MigrationFailed { reason: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StrataError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Wrap an I/O error with the path it happened at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoError { path: path.into(), source }
    }
}
