//! Stage producer collaborators and the values they exchange.
//!
//! The pipeline never parses transformation projects or evaluates governance
//! itself. It hands each stage's inputs to a producer behind one of these
//! traits and caches what comes back. Built-in implementations live in
//! [`crate::builtin`].

use std::collections::BTreeMap;
use std::fmt;

use floe_common::{ContentHash, ContentHasher, HashError, StageContext};
use floe_manifest::{EffectivePolicy, ResolvedManifest};
use serde::{Deserialize, Serialize};

use crate::error::ProducerError;
use crate::sources::ProjectSources;

/// Environment variables visible to profile resolution start with this.
pub const ENV_PREFIX: &str = "FLOE_";

/// Variables with this prefix hold credentials.
pub const SECRET_PREFIX: &str = "FLOE_SECRET_";

/// The environment captured once per invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    /// Captures every `FLOE_*` variable of the current process.
    pub fn from_process() -> Self {
        std::env::vars()
            .filter(|(name, _)| name.starts_with(ENV_PREFIX))
            .collect()
    }

    /// Looks up a variable.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Iterates over variables in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Digest of the snapshot for cache keys.
    ///
    /// Secret values are excluded; only the presence of each secret counts.
    pub fn digest(&self) -> Result<ContentHash, HashError> {
        let visible: BTreeMap<&str, Option<&str>> = self
            .iter()
            .map(|(name, value)| {
                if name.starts_with(SECRET_PREFIX) {
                    (name, None)
                } else {
                    (name, Some(value))
                }
            })
            .collect();
        ContentHasher::hash(&visible)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// A credential held by reference, never by value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretRef(String);

impl SecretRef {
    /// Reference to an environment variable, rendered `env:<NAME>`.
    pub fn env(name: &str) -> Self {
        Self(format!("env:{name}"))
    }

    /// The reference text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection profile for the transformation tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Product the profile belongs to.
    pub name: String,
    /// Deployment target (e.g. `dev`, `prod`).
    pub target: String,
    /// Adapter type, taken from the `compute` plugin selection.
    pub adapter: Option<String>,
    /// Plain connection settings.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    /// Credentials, as references.
    #[serde(default)]
    pub secrets: BTreeMap<String, SecretRef>,
}

/// One transformation model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelNode {
    /// Model name, unique within the project.
    pub name: String,
    /// Path relative to the project root.
    pub path: String,
    /// Models this one selects from, sorted.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Digest of the model file.
    pub checksum: ContentHash,
}

/// One reusable macro.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroNode {
    /// Macro name.
    pub name: String,
    /// Path relative to the project root.
    pub path: String,
}

/// Parsed transformation project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectManifest {
    /// Product name.
    pub name: String,
    /// Target the project was parsed for.
    pub target: String,
    /// Models, sorted by name.
    pub models: Vec<ModelNode>,
    /// Macros, sorted by name.
    pub macros: Vec<MacroNode>,
}

impl ProjectManifest {
    /// Looks up a model by name.
    pub fn model(&self, name: &str) -> Option<&ModelNode> {
        self.models.iter().find(|m| m.name == name)
    }
}

/// A governance policy the project does not satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Policy name.
    pub policy: String,
    /// What violates it (model name, `project`, ...).
    pub subject: String,
    /// Human-readable description.
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "governance.{}: {}: {}",
            self.policy, self.subject, self.message
        )
    }
}

/// Outcome of policy enforcement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementResult {
    /// Policies that were evaluated.
    pub checked: Vec<String>,
    /// Violations found, in evaluation order.
    pub violations: Vec<Violation>,
}

impl EnforcementResult {
    /// Returns `true` if nothing was violated.
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Stage 2 collaborator: turns resolved settings and environment into a profile.
pub trait ProfileResolver: Send + Sync {
    /// Builds the connection profile. Secrets must stay references.
    fn resolve_profile(
        &self,
        resolved: &ResolvedManifest,
        env: &EnvSnapshot,
        ctx: &StageContext,
    ) -> Result<Profile, ProducerError>;
}

/// Stage 3 collaborator: parses the transformation project.
pub trait ProjectParser: Send + Sync {
    /// Parses `sources` for the target described by `profile`.
    fn parse(
        &self,
        sources: &ProjectSources,
        profile: &Profile,
        ctx: &StageContext,
    ) -> Result<ProjectManifest, ProducerError>;
}

/// Stage 4 collaborator: checks a parsed project against governance.
pub trait PolicyEnforcer: Send + Sync {
    /// Evaluates every policy it understands.
    fn enforce(
        &self,
        project: &ProjectManifest,
        governance: &BTreeMap<String, EffectivePolicy>,
        ctx: &StageContext,
    ) -> Result<EnforcementResult, ProducerError>;
}
