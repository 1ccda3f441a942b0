//! Project discovery and configuration shared by CLI commands.

use std::path::{Path, PathBuf};

use floe_cache::{CacheConfig, FsCacheStore};
use floe_manifest::ProjectConfig;

use crate::GlobalArgs;

/// Name of the product configuration file.
pub const CONFIG_FILE: &str = "floe.toml";

/// Walks up from `start` looking for the nearest directory containing `floe.toml`.
pub fn find_project_root(start: &Path) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let mut current = start.to_path_buf();
    loop {
        if current.join(CONFIG_FILE).exists() {
            return Ok(current);
        }
        if !current.pop() {
            return Err(format!(
                "could not find {CONFIG_FILE} in {} or any parent directory",
                start.display()
            )
            .into());
        }
    }
}

/// Resolves the project root directory from global CLI args.
///
/// If `--config` is given, uses that path (file → parent dir, dir → itself).
/// Otherwise walks up from the current directory.
pub fn resolve_project_root(global: &GlobalArgs) -> Result<PathBuf, Box<dyn std::error::Error>> {
    match &global.config {
        Some(config_path) => {
            let p = PathBuf::from(config_path);
            if p.is_file() {
                Ok(p.parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from(".")))
            } else {
                Ok(p)
            }
        }
        None => find_project_root(&std::env::current_dir()?),
    }
}

/// Builds the persistent cache store described by `[cache]`.
pub fn open_store(project_dir: &Path, config: &ProjectConfig) -> FsCacheStore {
    let cache = CacheConfig::new(&project_dir.join(&config.cache.dir))
        .with_staleness_days(config.cache.staleness_days);
    FsCacheStore::new(cache)
}
