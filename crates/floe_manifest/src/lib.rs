//! Parsing, validation, and tiered resolution of platform manifests.
//!
//! This crate reads enterprise, domain, and product configuration and produces
//! a [`ResolvedManifest`] that enforces the enterprise plugin whitelist,
//! immutable governance policy, and domain product approval.

#![warn(missing_docs)]

pub mod error;
pub mod loader;
pub mod resolve;
pub mod types;

pub use error::{FetchError, ResolveError};
pub use loader::{
    load_manifest_from_str, load_project_config, load_project_config_from_str, validate_manifest,
    validate_product, FetchedManifest, FileFetcher, ManifestFetcher, ManifestLoader,
    ManifestSource, PreloadedManifests,
};
pub use resolve::{resolve_chain, ManifestResolver, PlatformChain};
pub use types::*;
