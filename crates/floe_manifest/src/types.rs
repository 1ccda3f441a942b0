//! Manifest and product types deserialized from TOML.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use floe_common::ContentHash;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A manifest's place in the inheritance hierarchy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// A standalone platform manifest (two-tier mode).
    #[default]
    None,
    /// The enterprise manifest: owns the plugin whitelist and immutable policy.
    Enterprise,
    /// A domain manifest inheriting from an enterprise parent.
    Domain,
}

/// The tier a resolved value came from.
///
/// Serialized through its string name so it can key JSON objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Tier {
    /// Enterprise manifest.
    Enterprise,
    /// Domain manifest.
    Domain,
    /// Scope-less platform manifest in two-tier mode.
    Platform,
    /// The product being compiled.
    Product,
}

impl Tier {
    /// Lower-case name used in reports and cache payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Enterprise => "enterprise",
            Tier::Domain => "domain",
            Tier::Platform => "platform",
            Tier::Product => "product",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Tier> for String {
    fn from(tier: Tier) -> Self {
        tier.as_str().to_string()
    }
}

impl TryFrom<String> for Tier {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "enterprise" => Ok(Tier::Enterprise),
            "domain" => Ok(Tier::Domain),
            "platform" => Ok(Tier::Platform),
            "product" => Ok(Tier::Product),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

/// Reference to a manifest, as understood by a [`ManifestFetcher`](crate::ManifestFetcher).
///
/// Examples: `platform/domain.toml`, `file:platform/enterprise.toml`,
/// `oci://registry.example.com/platform/sales:v3`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestRef(String);

impl ManifestRef {
    /// Wraps a reference string.
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// The raw reference string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ManifestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A governance policy declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernancePolicy {
    /// The policy value (string, number, bool, list, or table).
    pub value: Value,
    /// Whether lower tiers are forbidden from contradicting this value.
    #[serde(default)]
    pub immutable: bool,
}

/// A platform manifest document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Human-readable manifest name, used in error reports.
    #[serde(default)]
    pub name: Option<String>,
    /// Position in the inheritance hierarchy.
    #[serde(default)]
    pub scope: Scope,
    /// Selected plugin identifier per category (e.g. `compute = "duckdb"`).
    #[serde(default)]
    pub plugins: BTreeMap<String, String>,
    /// Allowed plugin identifiers per category. Enterprise scope only.
    #[serde(default)]
    pub approved_plugins: BTreeMap<String, BTreeSet<String>>,
    /// Governance policies by name.
    #[serde(default)]
    pub governance: BTreeMap<String, GovernancePolicy>,
    /// Products this domain admits. Domain scope only; absent means unrestricted.
    #[serde(default)]
    pub approved_products: Option<BTreeSet<String>>,
    /// The enterprise manifest this domain inherits from. Domain scope only.
    #[serde(default)]
    pub parent_manifest: Option<ManifestRef>,
}

/// A manifest together with its immutable content digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedManifest {
    /// Where the manifest was fetched from.
    pub reference: ManifestRef,
    /// Registry digest, or the SHA-256 of the fetched bytes.
    pub digest: ContentHash,
    /// The parsed, schema-validated manifest.
    pub manifest: Manifest,
}

impl LoadedManifest {
    /// Name for error reports: the manifest name, else its reference.
    pub fn display_name(&self) -> String {
        self.manifest
            .name
            .clone()
            .unwrap_or_else(|| self.reference.to_string())
    }
}

/// The product tier: the data product being compiled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSpec {
    /// Product name, checked against the domain's `approved_products`.
    pub name: String,
    /// The platform manifest this product inherits from.
    pub platform_ref: ManifestRef,
    /// Product-level governance overrides for mergeable policies.
    #[serde(default)]
    pub governance: BTreeMap<String, GovernancePolicy>,
    /// Always rejected when non-empty: plugin selection is a platform decision.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugins: BTreeMap<String, String>,
}

/// Effective value of one governance policy after merging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectivePolicy {
    /// The winning value.
    pub value: Value,
    /// Which tier supplied it.
    pub tier: Tier,
    /// Whether the value is locked by the enterprise.
    pub immutable: bool,
}

/// The merged configuration for one compilation.
///
/// Recomputed on every compile; only persisted as a cache payload keyed by
/// its own inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedManifest {
    /// The product this manifest was resolved for.
    pub product: String,
    /// Effective plugin selection.
    pub plugins: BTreeMap<String, String>,
    /// Effective governance with provenance.
    pub governance: BTreeMap<String, EffectivePolicy>,
    /// Enterprise whitelist, passed through for downstream validation.
    pub approved_plugins: BTreeMap<String, BTreeSet<String>>,
    /// Content digest per contributing tier.
    pub source_digests: BTreeMap<Tier, ContentHash>,
}

impl ResolvedManifest {
    /// The effective value of a policy, if any tier declares it.
    pub fn policy(&self, name: &str) -> Option<&Value> {
        self.governance.get(name).map(|p| &p.value)
    }
}

/// The top-level `floe.toml` of a data product project.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// The product tier.
    pub product: ProductSpec,
    /// Project file layout.
    #[serde(default)]
    pub project: ProjectLayout,
    /// Cache location and staleness window.
    #[serde(default)]
    pub cache: CacheSettings,
}

/// Where the transformation project's inputs live, relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProjectLayout {
    /// The transformation tool's project config file.
    #[serde(default = "default_config_file")]
    pub config_file: PathBuf,
    /// Directory holding model files.
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
    /// Directory holding macro files.
    #[serde(default = "default_macros_dir")]
    pub macros_dir: PathBuf,
}

impl Default for ProjectLayout {
    fn default() -> Self {
        Self {
            config_file: default_config_file(),
            models_dir: default_models_dir(),
            macros_dir: default_macros_dir(),
        }
    }
}

fn default_config_file() -> PathBuf {
    PathBuf::from("dbt_project.yml")
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_macros_dir() -> PathBuf {
    PathBuf::from("macros")
}

/// Cache settings from the `[cache]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CacheSettings {
    /// Cache root, relative to the project root unless absolute.
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    /// Entries older than this many days are treated as misses.
    #[serde(default = "default_staleness_days")]
    pub staleness_days: u32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            staleness_days: default_staleness_days(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".floe/cache")
}

fn default_staleness_days() -> u32 {
    30
}
