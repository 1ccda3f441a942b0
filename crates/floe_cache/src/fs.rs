//! Filesystem-backed cache store.
//!
//! Each entry is a JSON record at `<root>/<category>/<key>.json`. Records are
//! written to a temporary file in the same directory and then renamed into
//! place, so a reader never observes a partially written entry.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use floe_common::ContentHash;
use tracing::{debug, warn};

use crate::entry::{validate_entry, CacheCategory, CacheEntry, CacheInputs, MissReason};
use crate::error::CacheError;
use crate::store::{selected, CacheConfig, CacheLookup, CacheStats, CacheStore, CategoryStats};

/// File extension for cache records.
const ENTRY_EXT: &str = "json";

/// Persistent cache store rooted at a directory.
pub struct FsCacheStore {
    config: CacheConfig,
}

impl FsCacheStore {
    /// Creates a store; directories are created lazily on first write.
    pub fn new(config: CacheConfig) -> Self {
        Self { config }
    }

    /// The store's configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Directory holding one category.
    pub fn category_dir(&self, category: CacheCategory) -> PathBuf {
        self.config.root.join(category.as_str())
    }

    /// Returns the file path for the entry with the given key.
    pub fn entry_path(&self, category: CacheCategory, key: &ContentHash) -> PathBuf {
        self.category_dir(category).join(format!("{key}.{ENTRY_EXT}"))
    }

    fn ensure_dir(&self, category: CacheCategory) -> Result<PathBuf, CacheError> {
        let dir = self.category_dir(category);
        std::fs::create_dir_all(&dir).map_err(|e| CacheError::Io {
            path: dir.clone(),
            source: e,
        })?;
        Ok(dir)
    }

    fn read_entry(&self, path: &Path) -> Result<CacheEntry, CacheError> {
        let raw = std::fs::read_to_string(path).map_err(|e| CacheError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&raw).map_err(|e| CacheError::ReadCorruption {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Record files in a category directory; missing directories are empty.
    fn record_files(&self, category: CacheCategory) -> Result<Vec<PathBuf>, CacheError> {
        let dir = self.category_dir(category);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&dir).map_err(|e| CacheError::Io {
            path: dir.clone(),
            source: e,
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CacheError::Io {
                path: dir.clone(),
                source: e,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXT) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn remove(path: &Path) -> Result<(), CacheError> {
        std::fs::remove_file(path).map_err(|e| CacheError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

impl CacheStore for FsCacheStore {
    fn get(
        &self,
        category: CacheCategory,
        key: &ContentHash,
        inputs: &CacheInputs,
    ) -> CacheLookup {
        let path = self.entry_path(category, key);
        let entry = match self.read_entry(&path) {
            Ok(entry) => entry,
            Err(CacheError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                return CacheLookup::Miss(MissReason::NotFound);
            }
            Err(e) => {
                warn!(error = %e, "ignoring unreadable cache entry");
                return CacheLookup::Miss(MissReason::Corrupt {
                    detail: e.to_string(),
                });
            }
        };
        match validate_entry(&entry, key, inputs, Utc::now(), self.config.staleness) {
            Ok(()) => CacheLookup::Hit(entry),
            Err(reason) => {
                debug!(%category, %key, %reason, "cache entry rejected");
                CacheLookup::Miss(reason)
            }
        }
    }

    fn put(&self, category: CacheCategory, entry: &CacheEntry) -> Result<(), CacheError> {
        let dir = self.ensure_dir(category)?;
        let path = self.entry_path(category, &entry.cache_key);

        if let Ok(existing) = self.read_entry(&path) {
            if existing.same_content(entry) {
                debug!(%category, key = %entry.cache_key, "identical entry already cached");
                return Ok(());
            }
        }

        let json = serde_json::to_vec_pretty(entry).map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;
        let write_failure = |reason: String| CacheError::WriteFailure {
            path: path.clone(),
            reason,
        };

        let mut staged =
            tempfile::NamedTempFile::new_in(&dir).map_err(|e| write_failure(e.to_string()))?;
        staged
            .as_file_mut()
            .write_all(&json)
            .map_err(|e| write_failure(e.to_string()))?;
        staged
            .as_file()
            .sync_all()
            .map_err(|e| write_failure(e.to_string()))?;
        staged
            .persist(&path)
            .map_err(|e| write_failure(e.error.to_string()))?;

        debug!(%category, key = %entry.cache_key, bytes = json.len(), "cache entry written");
        Ok(())
    }

    fn delete(&self, category: CacheCategory, key: &ContentHash) -> Result<bool, CacheError> {
        let path = self.entry_path(category, key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::Io { path, source: e }),
        }
    }

    fn clear(
        &self,
        category: Option<CacheCategory>,
        older_than: Option<Duration>,
    ) -> Result<usize, CacheError> {
        let now = Utc::now();
        let mut removed = 0;
        for category in selected(category) {
            for path in self.record_files(category)? {
                let expired = match older_than {
                    None => true,
                    // Unreadable records are garbage regardless of age.
                    Some(limit) => self
                        .read_entry(&path)
                        .map_or(true, |entry| entry.age_at(now) > limit),
                };
                if expired {
                    Self::remove(&path)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    fn stats(&self) -> Result<CacheStats, CacheError> {
        let now = Utc::now();
        let mut stats = CacheStats::default();
        for category in CacheCategory::ALL {
            let mut cat = CategoryStats::default();
            for path in self.record_files(category)? {
                let meta = std::fs::metadata(&path).map_err(|e| CacheError::Io {
                    path: path.clone(),
                    source: e,
                })?;
                cat.count += 1;
                cat.total_size += meta.len();
                if let Ok(entry) = self.read_entry(&path) {
                    let age = entry.age_at(now);
                    cat.oldest_age = Some(cat.oldest_age.map_or(age, |old| old.max(age)));
                }
            }
            stats.categories.insert(category, cat);
        }
        Ok(stats)
    }

    fn entries(&self, category: CacheCategory) -> Result<Vec<CacheEntry>, CacheError> {
        let mut entries: Vec<CacheEntry> = self
            .record_files(category)?
            .iter()
            .filter_map(|path| self.read_entry(path).ok())
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    fn recent_entries(
        &self,
        category: CacheCategory,
        limit: usize,
    ) -> Result<Vec<CacheEntry>, CacheError> {
        // Records are immutable once renamed into place, so mtime orders them
        // by write time without parsing every file.
        let mut files: Vec<(SystemTime, PathBuf)> = self
            .record_files(category)?
            .into_iter()
            .filter_map(|path| {
                let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                Some((modified, path))
            })
            .collect();
        files.sort_by(|a, b| b.0.cmp(&a.0));

        let mut entries: Vec<CacheEntry> = files
            .iter()
            .filter_map(|(_, path)| self.read_entry(path).ok())
            .take(limit)
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }
}
