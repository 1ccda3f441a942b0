//! `floe compile`: staged, cached compile of the current data product.
//!
//! Runs the four pipeline stages against the project's persistent cache:
//! 1. Manifest-Load (enterprise and domain manifests)
//! 2. Profile-Resolve
//! 3. Project-Parse
//! 4. Policy-Enforce
//!
//! and writes the compiled artifacts as JSON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use floe_common::{CancelToken, Deadline, StageContext};
use floe_manifest::{FileFetcher, ManifestLoader};
use floe_pipeline::{
    CachePipeline, CompileRequest, CompiledArtifacts, DirectoryProjectParser, EnvProfileResolver,
    EnvSnapshot, GovernanceEnforcer, PipelineError, PipelineOptions, Producers, ProjectSources,
    StageReport, StageStatus,
};

use crate::project::{open_store, resolve_project_root};
use crate::{CompileArgs, GlobalArgs};

/// Default artifact location, relative to the project root.
const DEFAULT_OUTPUT: &str = ".floe/compiled_artifacts.json";

/// Runs the `floe compile` command.
///
/// Returns exit code 0 on success, 1 on validation or enforcement failure,
/// and 2 when a manifest or source could not be read or the compile was
/// interrupted.
pub fn run(args: &CompileArgs, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let project_dir = resolve_project_root(global)?;
    let config = match floe_manifest::load_project_config(&project_dir) {
        Ok(config) => config,
        Err(e) => return Ok(report_failure(&PipelineError::from(e))),
    };

    if !global.quiet {
        eprintln!("   Compiling {}", config.product.name);
    }

    let store = open_store(&project_dir, &config);
    let loader = ManifestLoader::new(FileFetcher::new(&project_dir));
    let sources = match ProjectSources::scan(&project_dir, &config.project) {
        Ok(sources) => sources,
        Err(e) => return Ok(report_failure(&e)),
    };
    let env = EnvSnapshot::from_process();

    let deadline = match args.timeout_secs {
        Some(secs) => Deadline::after(Duration::from_secs(secs)),
        None => Deadline::none(),
    };
    let ctx = StageContext::new(deadline, CancelToken::new());

    let producers = Producers {
        profiles: &EnvProfileResolver,
        parser: &DirectoryProjectParser,
        enforcer: &GovernanceEnforcer,
    };
    let options = PipelineOptions {
        no_cache: args.no_cache,
    };
    let verbose = global.verbose && !global.quiet;
    let observer = |report: &StageReport| {
        if verbose {
            eprintln!("{report}");
        }
    };
    let pipeline = CachePipeline::new(&store, &loader, producers, options).with_observer(&observer);

    let request = CompileRequest {
        product: &config.product,
        sources: &sources,
        env: &env,
    };
    let outcome = match pipeline.compile(request, &ctx) {
        Ok(outcome) => outcome,
        Err(e) => return Ok(report_failure(&e)),
    };

    let hits = outcome
        .reports
        .iter()
        .filter(|r| r.status == StageStatus::Hit)
        .count();
    let elapsed: Duration = outcome.reports.iter().map(|r| r.duration).sum();

    let artifacts = match outcome.artifacts.into_checked() {
        Ok(artifacts) => artifacts,
        Err(e) => return Ok(report_failure(&e)),
    };

    let output = output_path(&project_dir, args.output.as_deref());
    write_artifacts(&output, &artifacts)?;

    if !global.quiet {
        eprintln!("    Cached {hits} of {} stages", outcome.reports.len());
        eprintln!("     Wrote {}", output.display());
        eprintln!(
            "  Finished {} in {:.2}s",
            artifacts.product,
            elapsed.as_secs_f64()
        );
    }

    Ok(0)
}

/// Prints a pipeline failure with its kind and offending field, returning the exit code.
fn report_failure(err: &PipelineError) -> i32 {
    match err.field() {
        Some(field) => eprintln!("error[{}] {field}: {err}", err.kind()),
        None => eprintln!("error[{}]: {err}", err.kind()),
    }
    if let PipelineError::Enforcement { violations } = err {
        for violation in violations {
            eprintln!("  {violation}");
        }
    }
    err.exit_code()
}

/// Resolves `--output` against the project root.
fn output_path(project_dir: &Path, output: Option<&str>) -> PathBuf {
    match output {
        Some(path) => project_dir.join(path),
        None => project_dir.join(DEFAULT_OUTPUT),
    }
}

fn write_artifacts(
    path: &Path,
    artifacts: &CompiledArtifacts,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(artifacts)?;
    std::fs::write(path, json)?;
    tracing::debug!(path = %path.display(), "wrote compiled artifacts");
    Ok(())
}
