//! Staged, cache-aware compilation of a data product.
//!
//! [`CachePipeline`] runs Manifest-Load, Profile-Resolve, Project-Parse, and
//! Policy-Enforce in order. The first three are cached in an injected
//! [`floe_cache::CacheStore`] under keys chained from their inputs; policy
//! enforcement always runs.

#![warn(missing_docs)]

pub mod artifacts;
pub mod builtin;
pub mod error;
pub mod pipeline;
pub mod producer;
pub mod sources;
pub mod stage;

pub use artifacts::{CompiledArtifacts, CompiledArtifactsBuilder};
pub use builtin::{DirectoryProjectParser, EnvProfileResolver, GovernanceEnforcer};
pub use error::{PipelineError, ProducerError};
pub use pipeline::{
    CachePipeline, CompileOutcome, CompileRequest, PipelineOptions, Producers, TOOLCHAIN,
};
pub use producer::{
    EnforcementResult, EnvSnapshot, MacroNode, ModelNode, PolicyEnforcer, Profile,
    ProfileResolver, ProjectManifest, ProjectParser, SecretRef, Violation,
};
pub use sources::{ProjectSources, SourceFile};
pub use stage::{Stage, StageReason, StageReport, StageStatus};
