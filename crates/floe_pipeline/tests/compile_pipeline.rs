//! End-to-end compile tests against on-disk manifests and projects.
//!
//! Covers the resolution scenarios (two-tier, three-tier, immutable override,
//! unapproved selection), cache behavior across repeated invocations, and
//! deadline/cancellation handling.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use floe_cache::{
    CacheCategory, CacheConfig, CacheEntry, CacheError, CacheInputs, CacheLookup, CacheStats,
    CacheStore, FsCacheStore, MemoryCacheStore, MissReason,
};
use floe_common::{CancelToken, ContentHash, Deadline, StageContext};
use floe_manifest::{
    EffectivePolicy, FileFetcher, ManifestLoader, ManifestRef, ProductSpec, ProjectLayout,
    ResolveError,
};
use floe_pipeline::{
    CachePipeline, CompileOutcome, CompileRequest, DirectoryProjectParser, EnforcementResult,
    EnvProfileResolver, EnvSnapshot, GovernanceEnforcer, PipelineError, PipelineOptions,
    PolicyEnforcer, ProducerError, Producers, Profile, ProjectManifest, ProjectParser,
    ProjectSources, Stage, StageReason, StageStatus,
};
use serde_json::json;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helper: on-disk fixture
// ---------------------------------------------------------------------------

const ENTERPRISE: &str = r#"
name = "acme"
scope = "enterprise"

[approved_plugins]
compute = ["duckdb", "snowflake"]

[governance.pii_encryption]
value = "required"
immutable = true
"#;

fn domain(compute: &str, extra: &str) -> String {
    format!(
        r#"
name = "sales"
scope = "domain"
parent_manifest = "enterprise.toml"
approved_products = ["customer-360"]

[plugins]
compute = "{compute}"
{extra}"#
    )
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let fixture = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        fixture.write("dbt_project.yml", "name: customer_360\n");
        fixture.write("models/orders.sql", "select * from raw.orders");
        fixture.write(
            "models/customers.sql",
            "select * from raw.customers join {{ ref('orders') }} using (customer_id)",
        );
        fixture.write(
            "macros/cents.sql",
            "{% macro cents(x) %}{{ x }} / 100{% endmacro %}",
        );
        fixture
    }

    fn three_tier() -> Self {
        let fixture = Self::new();
        fixture.write("platform/enterprise.toml", ENTERPRISE);
        fixture.write("platform/domain.toml", &domain("snowflake", ""));
        fixture
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn write(&self, rel: &str, content: &str) {
        let path = self.root().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn loader(&self) -> ManifestLoader<FileFetcher> {
        ManifestLoader::new(FileFetcher::new(&self.root().join("platform")))
    }

    fn sources(&self) -> ProjectSources {
        ProjectSources::scan(self.root(), &ProjectLayout::default()).unwrap()
    }

    fn fs_store(&self) -> FsCacheStore {
        FsCacheStore::new(CacheConfig::new(&self.root().join(".floe/cache")))
    }
}

fn product(platform_ref: &str) -> ProductSpec {
    ProductSpec {
        name: "customer-360".to_string(),
        platform_ref: ManifestRef::new(platform_ref),
        governance: BTreeMap::new(),
        plugins: BTreeMap::new(),
    }
}

const BUILTIN: Producers<'static> = Producers {
    profiles: &EnvProfileResolver,
    parser: &DirectoryProjectParser,
    enforcer: &GovernanceEnforcer,
};

fn run(
    fixture: &Fixture,
    store: &dyn CacheStore,
    product: &ProductSpec,
    producers: Producers<'_>,
    options: PipelineOptions,
    ctx: &StageContext,
) -> Result<CompileOutcome, PipelineError> {
    let loader = fixture.loader();
    let sources = fixture.sources();
    let env = EnvSnapshot::default();
    CachePipeline::new(store, &loader, producers, options).compile(
        CompileRequest {
            product,
            sources: &sources,
            env: &env,
        },
        ctx,
    )
}

fn compile(fixture: &Fixture, store: &dyn CacheStore, product: &ProductSpec) -> CompileOutcome {
    run(
        fixture,
        store,
        product,
        BUILTIN,
        PipelineOptions::default(),
        &StageContext::default(),
    )
    .unwrap()
}

fn status(outcome: &CompileOutcome, stage: Stage) -> StageStatus {
    outcome.report(stage).unwrap().status
}

/// Input-name sets of every stored entry in `category`.
fn shapes(store: &dyn CacheStore, category: CacheCategory) -> Vec<BTreeSet<String>> {
    store
        .entries(category)
        .unwrap()
        .iter()
        .map(|e| e.inputs.keys().cloned().collect())
        .collect()
}

fn names(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// ===========================================================================
// Category A: Resolution scenarios
// ===========================================================================

#[test]
fn two_tier_platform_selects_plugin() {
    let fixture = Fixture::new();
    let platform = "[plugins]\ncompute = \"duckdb\"\n";
    fixture.write("platform/platform.toml", platform);
    let store = MemoryCacheStore::default();

    let outcome = compile(&fixture, &store, &product("platform.toml"));
    assert_eq!(outcome.artifacts.plugins["compute"], "duckdb");
    assert!(outcome.artifacts.source_digests.len() == 2);
}

#[test]
fn three_tier_happy_path() {
    let fixture = Fixture::three_tier();
    let store = MemoryCacheStore::default();

    let outcome = compile(&fixture, &store, &product("domain.toml"));
    assert_eq!(outcome.artifacts.plugins["compute"], "snowflake");
    assert_eq!(
        outcome.artifacts.governance["pii_encryption"],
        json!("required")
    );
    assert_eq!(outcome.artifacts.project.models.len(), 2);
    assert!(outcome.artifacts.enforcement.passed());
}

#[test]
fn immutable_override_is_rejected_before_parsing() {
    let fixture = Fixture::three_tier();
    fixture.write(
        "platform/domain.toml",
        &domain(
            "snowflake",
            "\n[governance.pii_encryption]\nvalue = \"optional\"\n",
        ),
    );
    let store = MemoryCacheStore::default();

    let err = run(
        &fixture,
        &store,
        &product("domain.toml"),
        BUILTIN,
        PipelineOptions::default(),
        &StageContext::default(),
    )
    .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Resolve(ResolveError::PolicyOverride { .. })
    ));
    assert_eq!(err.kind(), "policy_override");
    assert_eq!(err.field().as_deref(), Some("governance.pii_encryption"));
    assert_eq!(err.exit_code(), 1);
    assert!(store.entries(CacheCategory::Profiles).unwrap().is_empty());
    assert!(!shapes(&store, CacheCategory::Manifests)
        .iter()
        .any(|s| s.contains("model_files")));
}

#[test]
fn identical_immutable_value_is_accepted() {
    let fixture = Fixture::three_tier();
    fixture.write(
        "platform/domain.toml",
        &domain(
            "snowflake",
            "\n[governance.pii_encryption]\nvalue = \"required\"\n",
        ),
    );
    let store = MemoryCacheStore::default();
    let outcome = compile(&fixture, &store, &product("domain.toml"));
    assert_eq!(
        outcome.artifacts.governance["pii_encryption"],
        json!("required")
    );
}

#[test]
fn unapproved_plugin_is_rejected() {
    let fixture = Fixture::three_tier();
    fixture.write("platform/domain.toml", &domain("bigquery", ""));
    let store = MemoryCacheStore::default();

    let err = run(
        &fixture,
        &store,
        &product("domain.toml"),
        BUILTIN,
        PipelineOptions::default(),
        &StageContext::default(),
    )
    .unwrap_err();

    match err {
        PipelineError::Resolve(ResolveError::Approval {
            ref category,
            ref selected,
            ref allowed,
        }) => {
            assert_eq!(category, "compute");
            assert_eq!(selected, "bigquery");
            assert_eq!(allowed, &["duckdb", "snowflake"]);
        }
        other => panic!("expected approval error, got {other:?}"),
    }
}

#[test]
fn unapproved_product_is_rejected() {
    let fixture = Fixture::three_tier();
    let store = MemoryCacheStore::default();
    let mut other = product("domain.toml");
    other.name = "churn-model".to_string();

    let err = run(
        &fixture,
        &store,
        &other,
        BUILTIN,
        PipelineOptions::default(),
        &StageContext::default(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), "product_not_approved");
}

#[test]
fn missing_platform_manifest_is_fetch_error() {
    let fixture = Fixture::new();
    let store = MemoryCacheStore::default();
    let err = run(
        &fixture,
        &store,
        &product("nowhere.toml"),
        BUILTIN,
        PipelineOptions::default(),
        &StageContext::default(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), "fetch");
    assert_eq!(err.exit_code(), 2);
    assert_eq!(store.len(), 0);
}

#[test]
fn governance_violation_fails_the_check() {
    let fixture = Fixture::three_tier();
    fixture.write("models/FctOrders.sql", "select 1");
    let store = MemoryCacheStore::default();
    let mut spec = product("domain.toml");
    spec.governance.insert(
        "naming_convention".to_string(),
        serde_json::from_value(json!({"value": "snake_case"})).unwrap(),
    );

    let outcome = compile(&fixture, &store, &spec);
    let err = outcome.artifacts.into_checked().unwrap_err();
    assert_eq!(err.kind(), "enforcement");
    assert_eq!(err.field().as_deref(), Some("governance.naming_convention"));
}

// ===========================================================================
// Category B: Cache behavior
// ===========================================================================

#[test]
fn repeat_compile_hits_every_cached_stage() {
    let fixture = Fixture::three_tier();
    let store = fixture.fs_store();
    let spec = product("domain.toml");

    let first = compile(&fixture, &store, &spec);
    for stage in [Stage::ManifestLoad, Stage::ProfileResolve, Stage::ProjectParse] {
        assert_eq!(status(&first, stage), StageStatus::Miss);
    }

    let second = compile(&fixture, &store, &spec);
    for stage in [Stage::ManifestLoad, Stage::ProfileResolve, Stage::ProjectParse] {
        assert_eq!(status(&second, stage), StageStatus::Hit);
    }
    assert_eq!(status(&second, Stage::PolicyEnforce), StageStatus::Executed);
    assert_eq!(first.artifacts, second.artifacts);
}

#[test]
fn resolution_is_deterministic_across_stores() {
    let fixture = Fixture::three_tier();
    let spec = product("domain.toml");
    let a = MemoryCacheStore::default();
    let b = MemoryCacheStore::default();

    let first = compile(&fixture, &a, &spec);
    let second = compile(&fixture, &b, &spec);
    assert_eq!(first.artifacts, second.artifacts);

    for category in CacheCategory::ALL {
        let keys = |store: &MemoryCacheStore| -> BTreeSet<ContentHash> {
            store
                .entries(category)
                .unwrap()
                .iter()
                .map(|e| e.cache_key)
                .collect()
        };
        assert_eq!(keys(&a), keys(&b));
    }
}

#[test]
fn model_change_invalidates_only_project_parse() {
    let fixture = Fixture::three_tier();
    let store = fixture.fs_store();
    let spec = product("domain.toml");
    compile(&fixture, &store, &spec);

    fixture.write(
        "models/orders.sql",
        "select * from raw.orders where not deleted",
    );
    let outcome = compile(&fixture, &store, &spec);

    assert_eq!(status(&outcome, Stage::ManifestLoad), StageStatus::Hit);
    assert_eq!(status(&outcome, Stage::ProfileResolve), StageStatus::Hit);
    let parse = outcome.report(Stage::ProjectParse).unwrap();
    assert_eq!(parse.status, StageStatus::Miss);
    assert_eq!(
        parse.reason,
        Some(StageReason::Changed(vec!["model_files".to_string()]))
    );
}

#[test]
fn env_change_cascades_to_project_parse() {
    let fixture = Fixture::three_tier();
    let store = MemoryCacheStore::default();
    let spec = product("domain.toml");
    let loader = fixture.loader();
    let sources = fixture.sources();

    let compile_with = |env: &EnvSnapshot| {
        CachePipeline::new(&store, &loader, BUILTIN, PipelineOptions::default())
            .compile(
                CompileRequest {
                    product: &spec,
                    sources: &sources,
                    env,
                },
                &StageContext::default(),
            )
            .unwrap()
    };

    let dev: EnvSnapshot = [("FLOE_TARGET", "dev")].into_iter().collect();
    let prod: EnvSnapshot = [("FLOE_TARGET", "prod")].into_iter().collect();
    compile_with(&dev);
    let outcome = compile_with(&prod);

    assert_eq!(status(&outcome, Stage::ManifestLoad), StageStatus::Hit);
    assert_eq!(
        outcome.report(Stage::ProfileResolve).unwrap().reason,
        Some(StageReason::Changed(vec!["env_vars".to_string()]))
    );
    assert_eq!(
        outcome.report(Stage::ProjectParse).unwrap().reason,
        Some(StageReason::Changed(vec!["profiles".to_string()]))
    );
    assert_eq!(outcome.artifacts.project.target, "prod");
}

#[test]
fn edited_manifest_file_reports_revision_change() {
    let fixture = Fixture::three_tier();
    let store = fixture.fs_store();
    let spec = product("domain.toml");
    compile(&fixture, &store, &spec);

    fixture.write("platform/domain.toml", &domain("duckdb", ""));
    let outcome = compile(&fixture, &store, &spec);

    let load = outcome.report(Stage::ManifestLoad).unwrap();
    assert_eq!(load.status, StageStatus::Miss);
    assert_eq!(
        load.reason,
        Some(StageReason::Changed(vec!["revision".to_string()]))
    );
    assert_eq!(status(&outcome, Stage::ProfileResolve), StageStatus::Miss);
    assert_eq!(outcome.artifacts.plugins["compute"], "duckdb");
}

#[test]
fn tampered_manifest_entry_is_still_validated() {
    let fixture = Fixture::three_tier();
    let store = fixture.fs_store();
    let spec = product("domain.toml");
    compile(&fixture, &store, &spec);

    // Rewrite the cached domain manifest in place, keeping its key and inputs.
    let dir = store.category_dir(CacheCategory::Manifests);
    let mut tampered = 0;
    for entry in std::fs::read_dir(&dir).unwrap() {
        let path = entry.unwrap().path();
        let mut record: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        if record["payload"]["reference"] == json!("domain.toml") {
            record["payload"]["manifest"]["plugins"]["compute"] = json!("bigquery");
            std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();
            tampered += 1;
        }
    }
    assert_eq!(tampered, 1);

    let err = run(
        &fixture,
        &store,
        &spec,
        BUILTIN,
        PipelineOptions::default(),
        &StageContext::default(),
    )
    .unwrap_err();
    match err {
        PipelineError::Resolve(ResolveError::Approval { ref selected, .. }) => {
            assert_eq!(selected, "bigquery");
        }
        other => panic!("expected approval error, got {other:?}"),
    }
}

#[test]
fn records_from_another_format_are_recomputed() {
    let fixture = Fixture::three_tier();
    let store = fixture.fs_store();
    let spec = product("domain.toml");
    compile(&fixture, &store, &spec);

    for category in CacheCategory::ALL {
        for entry in std::fs::read_dir(store.category_dir(category)).unwrap() {
            let path = entry.unwrap().path();
            let mut record: serde_json::Value =
                serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
            record["format_version"] = json!(0);
            std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();
        }
    }

    let outcome = compile(&fixture, &store, &spec);
    for stage in [Stage::ManifestLoad, Stage::ProfileResolve, Stage::ProjectParse] {
        let report = outcome.report(stage).unwrap();
        assert_eq!(report.status, StageStatus::Miss);
        assert_eq!(
            report.reason,
            Some(StageReason::Lookup(MissReason::Incompatible { found: 0 }))
        );
    }

    let again = compile(&fixture, &store, &spec);
    assert_eq!(status(&again, Stage::ProjectParse), StageStatus::Hit);
}

#[test]
fn products_sharing_a_store_explain_misses_independently() {
    let fixture = Fixture::three_tier();
    fixture.write(
        "platform/marketing.toml",
        r#"
name = "marketing"
scope = "domain"
parent_manifest = "enterprise.toml"
approved_products = ["churn-model"]

[plugins]
compute = "duckdb"
"#,
    );
    let store = fixture.fs_store();
    let sales = product("domain.toml");
    let mut churn = product("marketing.toml");
    churn.name = "churn-model".to_string();

    compile(&fixture, &store, &sales);
    let first_churn = compile(&fixture, &store, &churn);
    for stage in [Stage::ProfileResolve, Stage::ProjectParse] {
        assert_eq!(
            first_churn.report(stage).unwrap().reason,
            Some(StageReason::Lookup(MissReason::NotFound)),
            "{stage}"
        );
    }
    assert_eq!(first_churn.artifacts.plugins["compute"], "duckdb");

    fixture.write(
        "models/orders.sql",
        "select * from raw.orders where not deleted",
    );
    let outcome = compile(&fixture, &store, &sales);
    assert_eq!(status(&outcome, Stage::ProfileResolve), StageStatus::Hit);
    assert_eq!(
        outcome.report(Stage::ProjectParse).unwrap().reason,
        Some(StageReason::Changed(vec!["model_files".to_string()]))
    );
}

#[test]
fn policy_enforcement_is_never_cached() {
    struct Counting(AtomicUsize);

    impl PolicyEnforcer for Counting {
        fn enforce(
            &self,
            project: &ProjectManifest,
            governance: &BTreeMap<String, EffectivePolicy>,
            ctx: &StageContext,
        ) -> Result<EnforcementResult, ProducerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            GovernanceEnforcer.enforce(project, governance, ctx)
        }
    }

    let fixture = Fixture::three_tier();
    let store = MemoryCacheStore::default();
    let spec = product("domain.toml");
    let enforcer = Counting(AtomicUsize::new(0));
    let producers = Producers {
        enforcer: &enforcer,
        ..BUILTIN
    };

    let mut after_first = None;
    for _ in 0..5 {
        let outcome = run(
            &fixture,
            &store,
            &spec,
            producers,
            PipelineOptions::default(),
            &StageContext::default(),
        )
        .unwrap();
        let enforce = status(&outcome, Stage::PolicyEnforce);
        assert_eq!(enforce, StageStatus::Executed);
        after_first.get_or_insert(store.len());
    }

    assert_eq!(enforcer.0.load(Ordering::SeqCst), 5);
    // Enterprise + domain manifests, one profile, one project.
    assert_eq!(after_first, Some(4));
    assert_eq!(store.len(), 4);

    let expected = [
        names(&["reference", "revision", "toolchain"]),
        names(&[
            "macro_files",
            "model_files",
            "product",
            "profiles",
            "project_config",
            "toolchain",
        ]),
        names(&[
            "env_vars",
            "platform",
            "product",
            "product_spec",
            "resolved",
            "toolchain",
        ]),
    ];
    for category in CacheCategory::ALL {
        for shape in shapes(&store, category) {
            assert!(
                expected.contains(&shape),
                "unexpected entry shape {shape:?}"
            );
        }
    }
}

#[test]
fn no_cache_forces_miss_and_refreshes_entries() {
    let fixture = Fixture::three_tier();
    let store = MemoryCacheStore::default();
    let spec = product("domain.toml");
    compile(&fixture, &store, &spec);

    let outcome = run(
        &fixture,
        &store,
        &spec,
        BUILTIN,
        PipelineOptions { no_cache: true },
        &StageContext::default(),
    )
    .unwrap();
    for stage in [Stage::ManifestLoad, Stage::ProfileResolve, Stage::ProjectParse] {
        let report = outcome.report(stage).unwrap();
        assert_eq!(report.status, StageStatus::Miss);
        assert_eq!(report.reason.as_ref().unwrap().to_string(), "no-cache");
    }
    assert_eq!(store.len(), 4);
}

#[test]
fn corrupt_entry_is_recomputed() {
    let fixture = Fixture::three_tier();
    let store = fixture.fs_store();
    let spec = product("domain.toml");
    compile(&fixture, &store, &spec);

    let dir = store.category_dir(CacheCategory::Profiles);
    for entry in std::fs::read_dir(&dir).unwrap() {
        std::fs::write(entry.unwrap().path(), "{ truncated").unwrap();
    }

    let outcome = compile(&fixture, &store, &spec);
    let profile = outcome.report(Stage::ProfileResolve).unwrap();
    assert_eq!(profile.status, StageStatus::Miss);
    assert!(profile.reason.as_ref().unwrap().to_string().starts_with("corrupt"));
    // The profile payload is byte-identical, so parsing still hits.
    assert_eq!(status(&outcome, Stage::ProjectParse), StageStatus::Hit);

    let again = compile(&fixture, &store, &spec);
    assert_eq!(status(&again, Stage::ProfileResolve), StageStatus::Hit);
}

#[test]
fn stale_entries_miss() {
    let fixture = Fixture::three_tier();
    let config = CacheConfig::new(&fixture.root().join("cache")).with_staleness(Duration::ZERO);
    let store = FsCacheStore::new(config);
    let spec = product("domain.toml");
    compile(&fixture, &store, &spec);
    std::thread::sleep(Duration::from_millis(20));

    let outcome = compile(&fixture, &store, &spec);
    let reason = outcome
        .report(Stage::ManifestLoad)
        .unwrap()
        .reason
        .as_ref()
        .unwrap()
        .to_string();
    assert!(reason.starts_with("stale"), "{reason}");
}

#[test]
fn write_failures_do_not_fail_compilation() {
    struct ReadOnly(MemoryCacheStore);

    impl CacheStore for ReadOnly {
        fn get(&self, c: CacheCategory, k: &ContentHash, i: &CacheInputs) -> CacheLookup {
            self.0.get(c, k, i)
        }
        fn put(&self, _c: CacheCategory, entry: &CacheEntry) -> Result<(), CacheError> {
            Err(CacheError::WriteFailure {
                path: format!("{}.json", entry.cache_key).into(),
                reason: "read-only filesystem".to_string(),
            })
        }
        fn delete(&self, c: CacheCategory, k: &ContentHash) -> Result<bool, CacheError> {
            self.0.delete(c, k)
        }
        fn clear(
            &self,
            c: Option<CacheCategory>,
            older_than: Option<Duration>,
        ) -> Result<usize, CacheError> {
            self.0.clear(c, older_than)
        }
        fn stats(&self) -> Result<CacheStats, CacheError> {
            self.0.stats()
        }
        fn entries(&self, c: CacheCategory) -> Result<Vec<CacheEntry>, CacheError> {
            self.0.entries(c)
        }
    }

    let fixture = Fixture::three_tier();
    let store = ReadOnly(MemoryCacheStore::default());
    let spec = product("domain.toml");
    let first = compile(&fixture, &store, &spec);
    let second = compile(&fixture, &store, &spec);
    assert_eq!(status(&second, Stage::ProjectParse), StageStatus::Miss);
    assert_eq!(first.artifacts, second.artifacts);
}

#[test]
fn concurrent_invocations_share_a_store() {
    let fixture = Fixture::three_tier();
    let store = fixture.fs_store();
    let spec = product("domain.toml");

    let outcomes: Vec<CompileOutcome> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| compile(&fixture, &store, &spec)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for outcome in &outcomes[1..] {
        assert_eq!(outcome.artifacts, outcomes[0].artifacts);
    }
    assert_eq!(store.stats().unwrap().total_count(), 4);
    let again = compile(&fixture, &store, &spec);
    assert_eq!(status(&again, Stage::ProjectParse), StageStatus::Hit);
}

// ===========================================================================
// Category C: Cache speedup
// ===========================================================================

struct SlowParser {
    delay: Duration,
    calls: AtomicUsize,
}

impl ProjectParser for SlowParser {
    fn parse(
        &self,
        sources: &ProjectSources,
        profile: &Profile,
        ctx: &StageContext,
    ) -> Result<ProjectManifest, ProducerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        DirectoryProjectParser.parse(sources, profile, ctx)
    }
}

#[test]
fn cached_parse_is_an_order_of_magnitude_faster() {
    let fixture = Fixture::three_tier();
    let store = MemoryCacheStore::default();
    let spec = product("domain.toml");
    let parser = SlowParser {
        delay: Duration::from_millis(200),
        calls: AtomicUsize::new(0),
    };
    let producers = Producers {
        parser: &parser,
        ..BUILTIN
    };
    let ctx = StageContext::default();
    let compile_with =
        |options| run(&fixture, &store, &spec, producers, options, &ctx).unwrap();

    let cold = compile_with(PipelineOptions::default());
    let warm = compile_with(PipelineOptions::default());
    let forced = compile_with(PipelineOptions { no_cache: true });

    let cold_parse = cold.report(Stage::ProjectParse).unwrap();
    let warm_parse = warm.report(Stage::ProjectParse).unwrap();
    assert_eq!(cold_parse.status, StageStatus::Miss);
    assert_eq!(warm_parse.status, StageStatus::Hit);
    assert!(
        warm_parse.duration <= cold_parse.duration / 10,
        "hit took {:?}, miss took {:?}",
        warm_parse.duration,
        cold_parse.duration
    );
    assert_eq!(status(&forced, Stage::ProjectParse), StageStatus::Miss);
    assert_eq!(parser.calls.load(Ordering::SeqCst), 2);

    for outcome in [&cold, &warm, &forced] {
        assert_eq!(status(outcome, Stage::PolicyEnforce), StageStatus::Executed);
    }
}

// ===========================================================================
// Category D: Deadlines and cancellation
// ===========================================================================

#[test]
fn expired_deadline_aborts_without_publishing() {
    let fixture = Fixture::three_tier();
    let store = MemoryCacheStore::default();
    let ctx = StageContext::new(Deadline::after(Duration::ZERO), CancelToken::new());

    let err = run(
        &fixture,
        &store,
        &product("domain.toml"),
        BUILTIN,
        PipelineOptions::default(),
        &ctx,
    )
    .unwrap_err();
    assert_eq!(err.kind(), "deadline");
    assert!(store.is_empty());
}

#[test]
fn cancellation_during_parse_publishes_no_parse_entry() {
    struct CancellingParser(CancelToken);

    impl ProjectParser for CancellingParser {
        fn parse(
            &self,
            sources: &ProjectSources,
            profile: &Profile,
            ctx: &StageContext,
        ) -> Result<ProjectManifest, ProducerError> {
            let project = DirectoryProjectParser.parse(sources, profile, ctx)?;
            self.0.cancel();
            Ok(project)
        }
    }

    let fixture = Fixture::three_tier();
    let store = MemoryCacheStore::default();
    let cancel = CancelToken::new();
    let parser = CancellingParser(cancel.clone());
    let producers = Producers {
        parser: &parser,
        ..BUILTIN
    };

    let err = run(
        &fixture,
        &store,
        &product("domain.toml"),
        producers,
        PipelineOptions::default(),
        &StageContext::new(Deadline::none(), cancel),
    )
    .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Interrupted {
            stage: Stage::ProjectParse,
            ..
        }
    ));
    assert_eq!(err.kind(), "cancelled");
    assert!(!shapes(&store, CacheCategory::Manifests)
        .iter()
        .any(|s| s.contains("model_files")));
}
