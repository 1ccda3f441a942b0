//! Final compile output.

use std::collections::BTreeMap;

use floe_common::ContentHash;
use floe_manifest::{ResolvedManifest, Tier};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;
use crate::producer::{EnforcementResult, ProjectManifest};

/// Everything a compile invocation produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledArtifacts {
    /// Product name.
    pub product: String,
    /// Effective plugin selections.
    pub plugins: BTreeMap<String, String>,
    /// Effective governance values.
    pub governance: BTreeMap<String, Value>,
    /// Digest of each tier that contributed.
    pub source_digests: BTreeMap<Tier, ContentHash>,
    /// Parsed project.
    pub project: ProjectManifest,
    /// Enforcement outcome from this invocation.
    pub enforcement: EnforcementResult,
}

impl CompiledArtifacts {
    /// Fails with [`PipelineError::Enforcement`] if any policy was violated.
    pub fn into_checked(self) -> Result<Self, PipelineError> {
        if self.enforcement.passed() {
            Ok(self)
        } else {
            Err(PipelineError::Enforcement {
                violations: self.enforcement.violations,
            })
        }
    }
}

/// Pure assembly of [`CompiledArtifacts`].
pub struct CompiledArtifactsBuilder;

impl CompiledArtifactsBuilder {
    /// Combines the resolved manifest with the Stage 3 and Stage 4 outputs.
    pub fn build(
        resolved: &ResolvedManifest,
        project: &ProjectManifest,
        enforcement: &EnforcementResult,
    ) -> CompiledArtifacts {
        CompiledArtifacts {
            product: resolved.product.clone(),
            plugins: resolved.plugins.clone(),
            governance: resolved
                .governance
                .iter()
                .map(|(name, policy)| (name.clone(), policy.value.clone()))
                .collect(),
            source_digests: resolved.source_digests.clone(),
            project: project.clone(),
            enforcement: enforcement.clone(),
        }
    }
}
