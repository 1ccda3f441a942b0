//! The staged, cache-aware compile pipeline.
//!
//! ```text
//! Manifest-Load ──► Profile-Resolve ──► Project-Parse ──► Policy-Enforce
//!   (manifests)        (profiles)         (manifests)       (never cached)
//! ```
//!
//! Each cached stage derives its key from the digests of its inputs, one of
//! which is the digest of the previous stage's output. A change anywhere
//! upstream therefore changes every downstream key without any explicit
//! invalidation. Every key also carries a `toolchain` input naming the
//! compiler release, so upgrading floe never serves outputs produced by an
//! older build.
//!
//! The merged platform manifest is resolved and validated on every
//! invocation, even when Stage 1 and Stage 2 are served from cache.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::time::Instant;

use floe_cache::{
    key_for, CacheCategory, CacheEntry, CacheInputs, CacheLookup, CacheStore, MissReason,
};
use floe_common::{ContentHash, ContentHasher, HashError, Interrupt, StageContext};
use floe_manifest::{
    resolve_chain, FetchError, LoadedManifest, ManifestRef, ManifestResolver, ManifestSource,
    PlatformChain, ProductSpec, ResolveError, ResolvedManifest,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::artifacts::{CompiledArtifacts, CompiledArtifactsBuilder};
use crate::error::PipelineError;
use crate::producer::{
    EnvSnapshot, PolicyEnforcer, Profile, ProfileResolver, ProjectManifest, ProjectParser,
};
use crate::sources::ProjectSources;
use crate::stage::{Stage, StageReason, StageReport, StageStatus};

/// Per-invocation switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Skip every cache lookup. Fresh outputs are still published.
    pub no_cache: bool,
}

/// The stage producer collaborators.
#[derive(Clone, Copy)]
pub struct Producers<'a> {
    /// Stage 2.
    pub profiles: &'a dyn ProfileResolver,
    /// Stage 3.
    pub parser: &'a dyn ProjectParser,
    /// Stage 4.
    pub enforcer: &'a dyn PolicyEnforcer,
}

/// Inputs of one compile invocation.
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest<'a> {
    /// The product being compiled.
    pub product: &'a ProductSpec,
    /// Scanned project files.
    pub sources: &'a ProjectSources,
    /// Environment captured for profile resolution.
    pub env: &'a EnvSnapshot,
}

/// Result of a successful invocation.
#[derive(Debug, Clone)]
pub struct CompileOutcome {
    /// The assembled output.
    pub artifacts: CompiledArtifacts,
    /// One report per stage, in order.
    pub reports: Vec<StageReport>,
}

impl CompileOutcome {
    /// The report for `stage`.
    pub fn report(&self, stage: Stage) -> Option<&StageReport> {
        self.reports.iter().find(|r| r.stage == stage)
    }
}

/// Release identity mixed into every cache key.
pub const TOOLCHAIN: &str = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"));

/// Most recent entries consulted when naming the inputs behind a miss.
const MISS_HISTORY: usize = 32;

/// Orchestrates the four stages against an injected cache store.
pub struct CachePipeline<'a> {
    store: &'a dyn CacheStore,
    manifests: &'a dyn ManifestSource,
    producers: Producers<'a>,
    options: PipelineOptions,
    toolchain: ContentHash,
    observer: Option<&'a dyn Fn(&StageReport)>,
}

impl<'a> CachePipeline<'a> {
    /// Creates a pipeline. Nothing is read until [`CachePipeline::compile`].
    pub fn new(
        store: &'a dyn CacheStore,
        manifests: &'a dyn ManifestSource,
        producers: Producers<'a>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            manifests,
            producers,
            options,
            toolchain: ContentHash::from_bytes(TOOLCHAIN.as_bytes()),
            observer: None,
        }
    }

    /// Replaces the release identity keyed into every entry (default [`TOOLCHAIN`]).
    pub fn with_toolchain(mut self, toolchain: &str) -> Self {
        self.toolchain = ContentHash::from_bytes(toolchain.as_bytes());
        self
    }

    /// Calls `observer` as each stage finishes.
    pub fn with_observer(mut self, observer: &'a dyn Fn(&StageReport)) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Runs all four stages.
    ///
    /// Validation, fetch, producer, and interrupt failures abort the
    /// invocation. Cache failures only cost the cache benefit.
    pub fn compile(
        &self,
        request: CompileRequest<'_>,
        ctx: &StageContext,
    ) -> Result<CompileOutcome, PipelineError> {
        let mut reports = Vec::with_capacity(Stage::ALL.len());

        // Stage 1: Manifest-Load
        checkpoint(ctx, Stage::ManifestLoad)?;
        let started = Instant::now();
        let loader = CachedManifests {
            pipeline: self,
            outcomes: RefCell::new(Vec::new()),
        };
        let chain = ManifestResolver::new(&loader).load_chain(request.product, ctx)?;
        let (status, reason) = loader.summary();
        self.finish(&mut reports, Stage::ManifestLoad, status, reason, started);

        // Stage 2: Profile-Resolve. The merge and its approval checks run on
        // every invocation; only the profile built from it is cached.
        checkpoint(ctx, Stage::ProfileResolve)?;
        let started = Instant::now();
        let resolved = resolve_chain(&chain, request.product)?;
        let inputs = profile_inputs(&chain, &resolved, &request, self.toolchain)?;
        let lookup = self.lookup::<Profile>(Stage::ProfileResolve, &inputs, Some("product"));
        let (profile, status, reason) = match lookup {
            Ok(profile) => (profile, StageStatus::Hit, None),
            Err(reason) => {
                let profile = self
                    .producers
                    .profiles
                    .resolve_profile(&resolved, request.env, ctx)
                    .map_err(|e| PipelineError::producer(Stage::ProfileResolve, e))?;
                self.publish(Stage::ProfileResolve, &inputs, &profile, ctx)
                    .map_err(|interrupt| PipelineError::Interrupted {
                        stage: Stage::ProfileResolve,
                        interrupt,
                    })?;
                (profile, StageStatus::Miss, Some(reason))
            }
        };
        self.finish(&mut reports, Stage::ProfileResolve, status, reason, started);

        // Stage 3: Project-Parse
        checkpoint(ctx, Stage::ProjectParse)?;
        let started = Instant::now();
        let inputs = project_inputs(&request, &profile, self.toolchain)?;
        let lookup = self.lookup::<ProjectManifest>(Stage::ProjectParse, &inputs, Some("product"));
        let (project, status, reason) = match lookup {
            Ok(project) => (project, StageStatus::Hit, None),
            Err(reason) => {
                let project = self
                    .producers
                    .parser
                    .parse(request.sources, &profile, ctx)
                    .map_err(|e| PipelineError::producer(Stage::ProjectParse, e))?;
                self.publish(Stage::ProjectParse, &inputs, &project, ctx)
                    .map_err(|interrupt| PipelineError::Interrupted {
                        stage: Stage::ProjectParse,
                        interrupt,
                    })?;
                (project, StageStatus::Miss, Some(reason))
            }
        };
        self.finish(&mut reports, Stage::ProjectParse, status, reason, started);

        // Stage 4: Policy-Enforce. No key is ever computed for this stage.
        checkpoint(ctx, Stage::PolicyEnforce)?;
        let started = Instant::now();
        let enforcement = self
            .producers
            .enforcer
            .enforce(&project, &resolved.governance, ctx)
            .map_err(|e| PipelineError::producer(Stage::PolicyEnforce, e))?;
        self.finish(
            &mut reports,
            Stage::PolicyEnforce,
            StageStatus::Executed,
            None,
            started,
        );

        let artifacts = CompiledArtifactsBuilder::build(&resolved, &project, &enforcement);
        Ok(CompileOutcome { artifacts, reports })
    }

    /// Looks up a stage output, returning why it missed on failure.
    fn lookup<T: DeserializeOwned>(
        &self,
        stage: Stage,
        inputs: &CacheInputs,
        anchor: Option<&str>,
    ) -> Result<T, StageReason> {
        let Some(category) = stage.cache_category() else {
            return Err(StageReason::Lookup(MissReason::Disabled));
        };
        if self.options.no_cache {
            return Err(StageReason::Lookup(MissReason::Disabled));
        }
        let key = key_for(inputs);
        match self.store.get(category, &key, inputs) {
            CacheLookup::Hit(entry) => match serde_json::from_value(entry.payload) {
                Ok(value) => {
                    debug!(%stage, %key, "cache hit");
                    Ok(value)
                }
                Err(e) => {
                    warn!(%stage, %key, error = %e, "cached payload has the wrong shape");
                    Err(StageReason::Lookup(MissReason::Corrupt {
                        detail: e.to_string(),
                    }))
                }
            },
            CacheLookup::Miss(MissReason::NotFound) => {
                debug!(%stage, %key, "cache miss");
                Err(self.explain_miss(category, inputs, anchor))
            }
            CacheLookup::Miss(reason) => {
                debug!(%stage, %key, %reason, "cache miss");
                Err(StageReason::Lookup(reason))
            }
        }
    }

    /// Names the inputs that differ from the newest entry of the same shape.
    ///
    /// With an `anchor`, only entries agreeing on that input are considered.
    /// Only the most recently written entries are read.
    fn explain_miss(
        &self,
        category: CacheCategory,
        inputs: &CacheInputs,
        anchor: Option<&str>,
    ) -> StageReason {
        let not_found = StageReason::Lookup(MissReason::NotFound);
        let Ok(entries) = self.store.recent_entries(category, MISS_HISTORY) else {
            return not_found;
        };
        let previous = entries.iter().find(|e| {
            e.inputs.keys().eq(inputs.keys())
                && anchor.map_or(true, |name| e.inputs.get(name) == inputs.get(name))
        });
        let Some(previous) = previous else {
            return not_found;
        };
        let changed: Vec<String> = inputs
            .iter()
            .filter(|(name, digest)| previous.inputs.get(*name) != Some(*digest))
            .map(|(name, _)| name.clone())
            .collect();
        if changed.is_empty() {
            not_found
        } else {
            StageReason::Changed(changed)
        }
    }

    /// Caches a stage output unless the invocation was interrupted.
    ///
    /// Store failures are logged and swallowed.
    fn publish<T: Serialize>(
        &self,
        stage: Stage,
        inputs: &CacheInputs,
        value: &T,
        ctx: &StageContext,
    ) -> Result<(), Interrupt> {
        ctx.checkpoint()?;
        let Some(category) = stage.cache_category() else {
            return Ok(());
        };
        let payload = match serde_json::to_value(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%stage, error = %e, "stage output cannot be cached");
                return Ok(());
            }
        };
        let entry = CacheEntry::new(inputs.clone(), payload);
        match self.store.put(category, &entry) {
            Ok(()) => debug!(%stage, key = %entry.cache_key, "cached stage output"),
            Err(e) => warn!(%stage, error = %e, "failed to cache stage output"),
        }
        Ok(())
    }

    fn finish(
        &self,
        reports: &mut Vec<StageReport>,
        stage: Stage,
        status: StageStatus,
        reason: Option<StageReason>,
        started: Instant,
    ) {
        let report = StageReport {
            stage,
            status,
            duration: started.elapsed(),
            reason,
        };
        info!(%stage, %status, duration = ?report.duration, "stage complete");
        if let Some(observer) = self.observer {
            observer(&report);
        }
        reports.push(report);
    }
}

fn checkpoint(ctx: &StageContext, stage: Stage) -> Result<(), PipelineError> {
    ctx.checkpoint()
        .map_err(|interrupt| PipelineError::Interrupted { stage, interrupt })
}

fn hashed<T: Serialize + ?Sized>(path: &str, value: &T) -> Result<ContentHash, PipelineError> {
    ContentHasher::hash(value)
        .map_err(|e: HashError| ResolveError::schema(path, e.to_string()).into())
}

/// Stage 2 key inputs: the platform chain and its merge, the product, and
/// the environment.
fn profile_inputs(
    chain: &PlatformChain,
    resolved: &ResolvedManifest,
    request: &CompileRequest<'_>,
    toolchain: ContentHash,
) -> Result<CacheInputs, PipelineError> {
    let mut platform = BTreeMap::new();
    if let Some(enterprise) = &chain.enterprise {
        platform.insert("enterprise".to_string(), enterprise.digest);
    }
    platform.insert(chain.base_tier().to_string(), chain.base.digest);

    let env_digest = request
        .env
        .digest()
        .map_err(|e| PipelineError::from(ResolveError::schema("env", e.to_string())))?;

    Ok(CacheInputs::from([
        ("platform".to_string(), ContentHasher::combine(&platform)),
        ("resolved".to_string(), hashed("resolved", resolved)?),
        ("product".to_string(), product_digest(request.product)),
        ("product_spec".to_string(), hashed("product", request.product)?),
        ("env_vars".to_string(), env_digest),
        ("toolchain".to_string(), toolchain),
    ]))
}

/// Stage 3 key inputs: project files plus the Stage 2 output.
fn project_inputs(
    request: &CompileRequest<'_>,
    profile: &Profile,
    toolchain: ContentHash,
) -> Result<CacheInputs, PipelineError> {
    let sources = request.sources;
    Ok(CacheInputs::from([
        ("product".to_string(), product_digest(request.product)),
        ("project_config".to_string(), sources.config_digest()),
        ("model_files".to_string(), sources.models_digest()),
        ("macro_files".to_string(), sources.macros_digest()),
        ("profiles".to_string(), hashed("profile", profile)?),
        ("toolchain".to_string(), toolchain),
    ]))
}

fn product_digest(product: &ProductSpec) -> ContentHash {
    ContentHash::from_bytes(product.name.as_bytes())
}

/// Stage 1 inputs for one manifest reference.
fn manifest_inputs(
    reference: &ManifestRef,
    revision: Option<ContentHash>,
    toolchain: ContentHash,
) -> CacheInputs {
    let mut inputs = CacheInputs::new();
    inputs.insert(
        "reference".to_string(),
        ContentHash::from_bytes(reference.as_str().as_bytes()),
    );
    if let Some(revision) = revision {
        inputs.insert("revision".to_string(), revision);
    }
    inputs.insert("toolchain".to_string(), toolchain);
    inputs
}

/// Stage 1 view of the manifest source: each reference goes through the cache.
struct CachedManifests<'p, 'a> {
    pipeline: &'p CachePipeline<'a>,
    outcomes: RefCell<Vec<Option<StageReason>>>,
}

impl CachedManifests<'_, '_> {
    /// HIT only if every manifest came from the cache; otherwise the first miss.
    fn summary(&self) -> (StageStatus, Option<StageReason>) {
        match self.outcomes.borrow().iter().flatten().next() {
            Some(reason) => (StageStatus::Miss, Some(reason.clone())),
            None => (StageStatus::Hit, None),
        }
    }
}

impl ManifestSource for CachedManifests<'_, '_> {
    fn load(
        &self,
        reference: &ManifestRef,
        ctx: &StageContext,
    ) -> Result<LoadedManifest, ResolveError> {
        let pipeline = self.pipeline;
        let inputs = manifest_inputs(
            reference,
            pipeline.manifests.revision(reference),
            pipeline.toolchain,
        );
        match pipeline.lookup::<LoadedManifest>(Stage::ManifestLoad, &inputs, Some("reference")) {
            Ok(loaded) if loaded.reference == *reference => {
                self.outcomes.borrow_mut().push(None);
                Ok(loaded)
            }
            lookup => {
                let reason = lookup
                    .err()
                    .unwrap_or(StageReason::Lookup(MissReason::InputsMismatch));
                let loaded = pipeline.manifests.load(reference, ctx)?;
                pipeline
                    .publish(Stage::ManifestLoad, &inputs, &loaded, ctx)
                    .map_err(|interrupt| FetchError::Interrupted {
                        reference: reference.clone(),
                        interrupt,
                    })?;
                self.outcomes.borrow_mut().push(Some(reason));
                Ok(loaded)
            }
        }
    }

    fn revision(&self, reference: &ManifestRef) -> Option<ContentHash> {
        self.pipeline.manifests.revision(reference)
    }
}
