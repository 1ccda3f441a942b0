//! Manifest fetching, parsing, and schema validation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use floe_common::{ContentHash, StageContext};

use crate::error::{FetchError, ResolveError};
use crate::types::{LoadedManifest, Manifest, ManifestRef, ProductSpec, ProjectConfig, Scope};

/// Raw manifest content returned by a fetch collaborator.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    /// The manifest document text.
    pub content: String,
    /// Registry digest, when the source provides one.
    pub digest: Option<ContentHash>,
}

/// External collaborator that retrieves manifest content.
///
/// Implementations own transport and any retry policy. They must honor the
/// context's deadline and cancellation.
pub trait ManifestFetcher: Send + Sync {
    /// Fetches the manifest at `reference`.
    fn fetch(
        &self,
        reference: &ManifestRef,
        ctx: &StageContext,
    ) -> Result<FetchedManifest, FetchError>;

    /// Fingerprint of the content currently behind a mutable reference.
    ///
    /// Registry references pinned by digest never change and return `None`.
    fn revision(&self, _reference: &ManifestRef) -> Option<ContentHash> {
        None
    }
}

/// Anything that can hand the resolver a loaded manifest.
pub trait ManifestSource {
    /// Loads and validates the manifest at `reference`.
    fn load(
        &self,
        reference: &ManifestRef,
        ctx: &StageContext,
    ) -> Result<LoadedManifest, ResolveError>;

    /// See [`ManifestFetcher::revision`].
    fn revision(&self, _reference: &ManifestRef) -> Option<ContentHash> {
        None
    }
}

/// Reads manifests from the local filesystem.
///
/// Accepts bare relative paths and `file:` references, both resolved against
/// the fetcher root. Registry references (`oci://`, `https://`) are rejected.
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    /// Creates a fetcher rooted at `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Maps a reference to the file it names.
    pub fn path_for(&self, reference: &ManifestRef) -> Result<PathBuf, FetchError> {
        let raw = reference.as_str();
        let rel = match raw.split_once("://") {
            Some(("file", rest)) => rest,
            Some((scheme, _)) => {
                return Err(FetchError::Unsupported {
                    reference: reference.clone(),
                    reason: format!("scheme '{scheme}' requires a registry fetcher"),
                })
            }
            None => raw.strip_prefix("file:").unwrap_or(raw),
        };
        Ok(self.root.join(rel))
    }
}

impl ManifestFetcher for FileFetcher {
    fn fetch(
        &self,
        reference: &ManifestRef,
        ctx: &StageContext,
    ) -> Result<FetchedManifest, FetchError> {
        ctx.checkpoint()
            .map_err(|interrupt| FetchError::Interrupted {
                reference: reference.clone(),
                interrupt,
            })?;
        let path = self.path_for(reference)?;
        let content = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FetchError::NotFound {
                    reference: reference.clone(),
                }
            } else {
                FetchError::Io {
                    reference: reference.clone(),
                    source: e,
                }
            }
        })?;
        Ok(FetchedManifest {
            content,
            digest: None,
        })
    }

    fn revision(&self, reference: &ManifestRef) -> Option<ContentHash> {
        let path = self.path_for(reference).ok()?;
        std::fs::read(path).ok().map(|bytes| ContentHash::from_bytes(&bytes))
    }
}

/// Thin adapter turning fetched content into a validated [`LoadedManifest`].
pub struct ManifestLoader<F> {
    fetcher: F,
}

impl<F: ManifestFetcher> ManifestLoader<F> {
    /// Wraps a fetch collaborator.
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }

    /// The wrapped fetcher.
    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }
}

impl<F: ManifestFetcher> ManifestSource for ManifestLoader<F> {
    fn load(
        &self,
        reference: &ManifestRef,
        ctx: &StageContext,
    ) -> Result<LoadedManifest, ResolveError> {
        let fetched = self.fetcher.fetch(reference, ctx)?;
        let digest = fetched
            .digest
            .unwrap_or_else(|| ContentHash::from_bytes(fetched.content.as_bytes()));
        let manifest = load_manifest_from_str(&fetched.content, reference)?;
        Ok(LoadedManifest {
            reference: reference.clone(),
            digest,
            manifest,
        })
    }

    fn revision(&self, reference: &ManifestRef) -> Option<ContentHash> {
        self.fetcher.revision(reference)
    }
}

/// Manifests already in memory, e.g. the output of a cached load stage.
#[derive(Debug, Clone, Default)]
pub struct PreloadedManifests {
    manifests: BTreeMap<ManifestRef, LoadedManifest>,
}

impl PreloadedManifests {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a manifest under its own reference.
    pub fn insert(&mut self, loaded: LoadedManifest) {
        self.manifests.insert(loaded.reference.clone(), loaded);
    }

    /// Iterates over the held manifests in reference order.
    pub fn iter(&self) -> impl Iterator<Item = &LoadedManifest> {
        self.manifests.values()
    }
}

impl FromIterator<LoadedManifest> for PreloadedManifests {
    fn from_iter<I: IntoIterator<Item = LoadedManifest>>(iter: I) -> Self {
        let mut set = Self::new();
        for loaded in iter {
            set.insert(loaded);
        }
        set
    }
}

impl ManifestSource for PreloadedManifests {
    fn load(
        &self,
        reference: &ManifestRef,
        _ctx: &StageContext,
    ) -> Result<LoadedManifest, ResolveError> {
        self.manifests.get(reference).cloned().ok_or_else(|| {
            FetchError::NotFound {
                reference: reference.clone(),
            }
            .into()
        })
    }
}

/// Parses and schema-validates a manifest document.
pub fn load_manifest_from_str(
    content: &str,
    reference: &ManifestRef,
) -> Result<Manifest, ResolveError> {
    let manifest: Manifest = toml::from_str(content)
        .map_err(|e| ResolveError::schema(reference.to_string(), e.to_string()))?;
    validate_manifest(&manifest)?;
    Ok(manifest)
}

/// Enforces which fields each scope may declare.
///
/// Whitelists and immutable policy belong to the enterprise alone; parent
/// links and product approval belong to domains alone.
pub fn validate_manifest(manifest: &Manifest) -> Result<(), ResolveError> {
    if manifest.scope != Scope::Enterprise {
        if !manifest.approved_plugins.is_empty() {
            return Err(ResolveError::schema(
                "approved_plugins",
                "only an enterprise-scope manifest may declare approved_plugins",
            ));
        }
        if let Some((name, _)) = manifest.governance.iter().find(|(_, p)| p.immutable) {
            return Err(ResolveError::schema(
                format!("governance.{name}.immutable"),
                "only an enterprise-scope manifest may mark a policy immutable",
            ));
        }
    }

    if manifest.scope == Scope::Domain {
        if manifest.parent_manifest.is_none() {
            return Err(ResolveError::schema(
                "parent_manifest",
                "a domain-scope manifest must declare parent_manifest",
            ));
        }
    } else {
        if manifest.parent_manifest.is_some() {
            return Err(ResolveError::schema(
                "parent_manifest",
                "only a domain-scope manifest may declare parent_manifest",
            ));
        }
        if manifest.approved_products.is_some() {
            return Err(ResolveError::schema(
                "approved_products",
                "only a domain-scope manifest may declare approved_products",
            ));
        }
    }

    Ok(())
}

/// Checks the product tier: it may not select plugins or lock policy.
pub fn validate_product(product: &ProductSpec) -> Result<(), ResolveError> {
    if product.name.is_empty() {
        return Err(ResolveError::schema("product.name", "missing required field"));
    }
    if product.platform_ref.as_str().is_empty() {
        return Err(ResolveError::schema(
            "product.platform_ref",
            "missing required field",
        ));
    }
    if let Some(category) = product.plugins.keys().next() {
        return Err(ResolveError::schema(
            format!("product.plugins.{category}"),
            "plugin selection is a platform decision; products may not redeclare plugins",
        ));
    }
    if let Some((name, _)) = product.governance.iter().find(|(_, p)| p.immutable) {
        return Err(ResolveError::schema(
            format!("product.governance.{name}.immutable"),
            "only an enterprise-scope manifest may mark a policy immutable",
        ));
    }
    Ok(())
}

/// Loads and validates `floe.toml` from a project directory.
pub fn load_project_config(project_dir: &Path) -> Result<ProjectConfig, ResolveError> {
    let path = project_dir.join("floe.toml");
    let content = std::fs::read_to_string(&path).map_err(|e| FetchError::Io {
        reference: ManifestRef::new(path.display().to_string()),
        source: e,
    })?;
    load_project_config_from_str(&content)
}

/// Parses and validates a `floe.toml` document.
pub fn load_project_config_from_str(content: &str) -> Result<ProjectConfig, ResolveError> {
    let config: ProjectConfig =
        toml::from_str(content).map_err(|e| ResolveError::schema("floe.toml", e.to_string()))?;
    validate_product(&config.product)?;
    Ok(config)
}
