//! Floe CLI, the command-line interface for compiling governed data products.
//!
//! Provides `floe compile` for the staged, cached compile of the current
//! project and `floe cache` for inspecting and clearing the compile cache.

#![warn(missing_docs)]

mod cache;
mod compile;
mod project;

use std::process;

use clap::{Parser, Subcommand};
use floe_cache::CacheCategory;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Floe, a cache-aware compiler for governed data products.
#[derive(Parser, Debug)]
#[command(name = "floe", version, about = "Floe data product compiler")]
pub struct Cli {
    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Print one line per stage with its cache status and miss reason.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Tracing filter (e.g. `warn`, `floe_pipeline=debug`).
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Path to a custom `floe.toml`, or the project directory holding one.
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile the current data product.
    Compile(CompileArgs),
    /// Inspect or clear the compile cache.
    Cache {
        /// The cache operation.
        #[command(subcommand)]
        command: CacheCommand,
    },
}

/// Arguments for the `floe compile` subcommand.
#[derive(Parser, Debug)]
pub struct CompileArgs {
    /// Skip every cache lookup and recompute all stages.
    #[arg(long)]
    pub no_cache: bool,

    /// Abort the compile after this many seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Where to write the compiled artifacts (default: `.floe/compiled_artifacts.json`).
    #[arg(short, long)]
    pub output: Option<String>,
}

/// Cache management operations.
#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Remove cache entries.
    Clear {
        /// Only clear this category (`profiles` or `manifests`).
        #[arg(long)]
        category: Option<CacheCategory>,

        /// Only remove entries older than this many days.
        #[arg(long)]
        older_than_days: Option<u32>,
    },
    /// Show entry counts, sizes, and ages per category.
    Stats,
}

/// Global settings derived from CLI flags.
pub struct GlobalArgs {
    /// Whether to suppress non-error output.
    pub quiet: bool,
    /// Whether to print per-stage report lines.
    pub verbose: bool,
    /// Optional path to a custom config file.
    pub config: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let global = GlobalArgs {
        quiet: cli.quiet,
        verbose: cli.verbose,
        config: cli.config,
    };

    let result = match cli.command {
        Command::Compile(ref args) => compile::run(args, &global),
        Command::Cache { ref command } => cache::run(command, &global),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(2);
        }
    }
}
