//! Three-tier resolution: merging enterprise, domain, and product settings.
//!
//! Mergeable fields follow "closest to the product wins". Immutable enterprise
//! policy always wins, and any lower tier contradicting it is a hard error.
//! Checks run in a fixed order (whitelist, immutability, product approval) so
//! identical bad inputs always report the same first violation.

use std::collections::BTreeMap;

use floe_common::{ContentHasher, StageContext};
use tracing::debug;

use crate::error::ResolveError;
use crate::loader::{validate_product, ManifestSource};
use crate::types::{
    EffectivePolicy, GovernancePolicy, LoadedManifest, ProductSpec, ResolvedManifest, Scope, Tier,
};

/// The platform manifests a product inherits from.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformChain {
    /// The manifest named by the product's `platform_ref`.
    pub base: LoadedManifest,
    /// The enterprise parent, present only when `base` is domain-scoped.
    pub enterprise: Option<LoadedManifest>,
}

impl PlatformChain {
    /// The tier `base` occupies.
    pub fn base_tier(&self) -> Tier {
        match self.base.manifest.scope {
            Scope::Domain => Tier::Domain,
            Scope::Enterprise => Tier::Enterprise,
            Scope::None => Tier::Platform,
        }
    }
}

/// Resolves products against manifests supplied by a [`ManifestSource`].
pub struct ManifestResolver<'a, S: ?Sized> {
    source: &'a S,
}

impl<'a, S: ManifestSource + ?Sized> ManifestResolver<'a, S> {
    /// Creates a resolver reading manifests from `source`.
    pub fn new(source: &'a S) -> Self {
        Self { source }
    }

    /// Loads and merges every tier for `product`.
    pub fn resolve(
        &self,
        product: &ProductSpec,
        ctx: &StageContext,
    ) -> Result<ResolvedManifest, ResolveError> {
        let chain = self.load_chain(product, ctx)?;
        resolve_chain(&chain, product)
    }

    /// Loads the platform manifest and, for domains, its enterprise parent.
    pub fn load_chain(
        &self,
        product: &ProductSpec,
        ctx: &StageContext,
    ) -> Result<PlatformChain, ResolveError> {
        validate_product(product)?;
        let base = self.source.load(&product.platform_ref, ctx)?;

        let enterprise = match (&base.manifest.scope, &base.manifest.parent_manifest) {
            (Scope::Domain, Some(parent_ref)) => {
                let parent = self.source.load(parent_ref, ctx)?;
                if parent.manifest.scope != Scope::Enterprise {
                    return Err(ResolveError::schema(
                        "parent_manifest",
                        format!(
                            "parent '{}' of domain '{}' must be enterprise-scoped",
                            parent.reference,
                            base.display_name()
                        ),
                    ));
                }
                Some(parent)
            }
            (Scope::Domain, None) => {
                return Err(ResolveError::schema(
                    "parent_manifest",
                    "a domain-scope manifest must declare parent_manifest",
                ))
            }
            _ => None,
        };

        Ok(PlatformChain { base, enterprise })
    }
}

/// Validates and merges an already-loaded chain for `product`.
///
/// Pure: no I/O, same inputs always yield the same result or the same error.
pub fn resolve_chain(
    chain: &PlatformChain,
    product: &ProductSpec,
) -> Result<ResolvedManifest, ResolveError> {
    validate_product(product)?;
    let base = &chain.base;
    let base_tier = chain.base_tier();

    // The enterprise whitelist applies to the domain; a lone enterprise
    // manifest is held to its own whitelist.
    match &chain.enterprise {
        Some(enterprise) => check_whitelist(base, enterprise, true)?,
        None if base.manifest.scope == Scope::Enterprise => check_whitelist(base, base, false)?,
        None => {}
    }

    let locking = chain
        .enterprise
        .as_ref()
        .or((base.manifest.scope == Scope::Enterprise).then_some(base));
    if let Some(enterprise) = locking {
        if chain.enterprise.is_some() {
            check_immutable(enterprise, &base.manifest.governance, Tier::Domain)?;
        }
        check_immutable(enterprise, &product.governance, Tier::Product)?;
    }

    if chain.enterprise.is_some() {
        if let Some(approved) = &base.manifest.approved_products {
            if !approved.contains(&product.name) {
                return Err(ResolveError::ProductNotApproved {
                    product: product.name.clone(),
                    domain: base.display_name(),
                });
            }
        }
    }

    let mut governance = BTreeMap::new();
    if let Some(enterprise) = &chain.enterprise {
        merge_governance(
            &mut governance,
            &enterprise.manifest.governance,
            Tier::Enterprise,
        );
    }
    merge_governance(&mut governance, &base.manifest.governance, base_tier);
    merge_governance(&mut governance, &product.governance, Tier::Product);

    let approved_plugins = match &chain.enterprise {
        Some(enterprise) => enterprise.manifest.approved_plugins.clone(),
        None => base.manifest.approved_plugins.clone(),
    };

    let mut source_digests = BTreeMap::new();
    if let Some(enterprise) = &chain.enterprise {
        source_digests.insert(Tier::Enterprise, enterprise.digest);
    }
    source_digests.insert(base_tier, base.digest);
    let product_digest = ContentHasher::hash(product)
        .map_err(|e| ResolveError::schema("product", e.to_string()))?;
    source_digests.insert(Tier::Product, product_digest);

    debug!(
        product = %product.name,
        tiers = source_digests.len(),
        policies = governance.len(),
        "resolved manifest"
    );

    Ok(ResolvedManifest {
        product: product.name.clone(),
        plugins: base.manifest.plugins.clone(),
        governance,
        approved_plugins,
        source_digests,
    })
}

/// Every selection in `selector` must be whitelisted by `whitelist`.
///
/// With `strict`, a category missing from the whitelist allows nothing;
/// otherwise only whitelisted categories are checked.
fn check_whitelist(
    selector: &LoadedManifest,
    whitelist: &LoadedManifest,
    strict: bool,
) -> Result<(), ResolveError> {
    let approved = &whitelist.manifest.approved_plugins;
    for (category, selected) in &selector.manifest.plugins {
        let allowed = match approved.get(category) {
            Some(allowed) => allowed,
            None if strict => {
                return Err(ResolveError::Approval {
                    category: category.clone(),
                    selected: selected.clone(),
                    allowed: Vec::new(),
                })
            }
            None => continue,
        };
        if !allowed.contains(selected) {
            return Err(ResolveError::Approval {
                category: category.clone(),
                selected: selected.clone(),
                allowed: allowed.iter().cloned().collect(),
            });
        }
    }
    Ok(())
}

/// Lower-tier declarations of immutable policies must repeat the enterprise value.
fn check_immutable(
    enterprise: &LoadedManifest,
    declared: &BTreeMap<String, GovernancePolicy>,
    tier: Tier,
) -> Result<(), ResolveError> {
    for (policy, locked) in enterprise
        .manifest
        .governance
        .iter()
        .filter(|(_, p)| p.immutable)
    {
        if let Some(lower) = declared.get(policy) {
            if lower.value != locked.value {
                return Err(ResolveError::PolicyOverride {
                    policy: policy.clone(),
                    enterprise_value: locked.value.clone(),
                    domain_value: lower.value.clone(),
                    tier,
                });
            }
        }
    }
    Ok(())
}

/// Overlays `declared` onto `merged`, skipping anything already locked.
///
/// List values replace rather than union.
fn merge_governance(
    merged: &mut BTreeMap<String, EffectivePolicy>,
    declared: &BTreeMap<String, GovernancePolicy>,
    tier: Tier,
) {
    for (name, policy) in declared {
        if merged.get(name).is_some_and(|existing| existing.immutable) {
            continue;
        }
        merged.insert(
            name.clone(),
            EffectivePolicy {
                value: policy.value.clone(),
                tier,
                immutable: policy.immutable,
            },
        );
    }
}
