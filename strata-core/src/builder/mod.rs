//! Image building system for Strata.
//!
//! This module provides Dockerfile parsing, build planning, layer caching
//! and step execution for creating Strata images.

pub mod base;
pub mod build;
pub mod cache;
pub mod context;
pub mod executor;
pub mod expand;
pub mod layer;
pub mod oci;
pub mod parser;
pub mod plan;
pub mod runner;

pub use base::{BaseImageResolver, ResolvedBase, StoreResolver};
pub use build::{build_image, open_builder};
pub use cache::{CacheError, CacheLookupResult, CachedLayer, LayerCache};
pub use context::BuildContext;
pub use executor::{BuildError, BuildOptions, BuildPhase, BuildReport, BuildResult, Builder, StepOutcome};
pub use oci::{OciRegistry, Registry};
pub use parser::{parse_dockerfile, Dockerfile, Instruction, ParseError};
pub use plan::BuildPlan;
pub use runner::{ProcessRunner, StepRunner};
