//! Project source discovery and hashing.
//!
//! Scans the transformation project for its config file, model files, and
//! macro files. Each group is digested over its sorted relative paths and file
//! digests, so renaming, editing, adding, or removing a file changes exactly
//! the digest of the group it belongs to.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use floe_common::{ContentHash, ContentHasher};
use floe_manifest::ProjectLayout;
use tracing::debug;

use crate::error::PipelineError;

/// File extensions recognized as models.
pub const MODEL_EXTENSIONS: &[&str] = &["sql", "py"];

/// File extensions recognized as macros.
pub const MACRO_EXTENSIONS: &[&str] = &["sql"];

/// One project file with its digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Path relative to the project root, `/`-separated.
    pub path: String,
    /// SHA-256 of the file bytes.
    pub digest: ContentHash,
    /// File contents.
    pub content: String,
}

impl SourceFile {
    /// Builds a file from in-memory content.
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            digest: ContentHash::from_bytes(content.as_bytes()),
            content,
        }
    }

    /// File stem of the relative path (`models/orders.sql` -> `orders`).
    pub fn stem(&self) -> &str {
        let name = self.path.rsplit('/').next().unwrap_or(&self.path);
        name.split_once('.').map_or(name, |(stem, _)| stem)
    }
}

/// Everything Stage 3 reads from the project directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectSources {
    /// The tool's project config file, if present.
    pub config: Option<SourceFile>,
    /// Model files, sorted by path.
    pub models: Vec<SourceFile>,
    /// Macro files, sorted by path.
    pub macros: Vec<SourceFile>,
}

impl ProjectSources {
    /// Scans `root` according to `layout`.
    ///
    /// Missing model or macro directories count as empty.
    pub fn scan(root: &Path, layout: &ProjectLayout) -> Result<Self, PipelineError> {
        let config_path = root.join(&layout.config_file);
        let config = if config_path.is_file() {
            Some(read_source(root, &config_path)?)
        } else {
            None
        };
        Ok(Self {
            config,
            models: scan_dir(root, &layout.models_dir, MODEL_EXTENSIONS)?,
            macros: scan_dir(root, &layout.macros_dir, MACRO_EXTENSIONS)?,
        })
    }

    /// Digest of the project config file.
    pub fn config_digest(&self) -> ContentHash {
        group_digest(self.config.as_slice())
    }

    /// Digest of all model files.
    pub fn models_digest(&self) -> ContentHash {
        group_digest(&self.models)
    }

    /// Digest of all macro files.
    pub fn macros_digest(&self) -> ContentHash {
        group_digest(&self.macros)
    }
}

fn group_digest(files: &[SourceFile]) -> ContentHash {
    let named: BTreeMap<String, ContentHash> = files
        .iter()
        .map(|f| (f.path.clone(), f.digest))
        .collect();
    ContentHasher::combine(&named)
}

fn scan_dir(
    root: &Path,
    rel_dir: &Path,
    extensions: &[&str],
) -> Result<Vec<SourceFile>, PipelineError> {
    let dir = root.join(rel_dir);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    walk_dir(&dir, extensions, &mut paths)?;
    paths.sort();
    paths.iter().map(|p| read_source(root, p)).collect()
}

/// Recursively collects files with one of `extensions`.
///
/// Symbolic links are skipped, both to files and to directories.
fn walk_dir(
    dir: &Path,
    extensions: &[&str],
    out: &mut Vec<PathBuf>,
) -> Result<(), PipelineError> {
    let io_err = |e| PipelineError::Source {
        path: dir.to_path_buf(),
        source: e,
    };
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let file_type = entry.file_type().map_err(io_err)?;
        let path = entry.path();
        if file_type.is_symlink() {
            debug!(path = %path.display(), "skipping symlink in project sources");
        } else if file_type.is_dir() {
            walk_dir(&path, extensions, out)?;
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| extensions.contains(&e))
        {
            out.push(path);
        }
    }
    Ok(())
}

fn read_source(root: &Path, path: &Path) -> Result<SourceFile, PipelineError> {
    let bytes = std::fs::read(path).map_err(|e| PipelineError::Source {
        path: path.to_path_buf(),
        source: e,
    })?;
    let content = String::from_utf8(bytes).map_err(|e| PipelineError::SourceEncoding {
        path: path.to_path_buf(),
        valid_up_to: e.utf8_error().valid_up_to(),
    })?;
    let rel = path.strip_prefix(root).unwrap_or(path);
    let rel = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    Ok(SourceFile::new(rel, content))
}
