//! Strata Core Library
//!
//! Builds layered, content-addressed container images from Dockerfiles and
//! runs containers from them.

pub mod builder;
pub mod config;
pub mod error;
pub mod events;
pub mod observability;
pub mod paths;
pub mod runtime;
pub mod state;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use config::Config;
pub use error::{Result, StrataError};
pub use observability::init as init_observability;
pub use state::StateManager;
pub use store::ImageStore;
pub use types::{Image, ImageConfig, ImageReference};
