//! Core domain types for Strata.

pub mod image;

// Re-exports
pub use image::{
    short_digest, Image, ImageConfig, ImageReference, LayerDescriptor, LayerHistory, DEFAULT_TAG,
};
