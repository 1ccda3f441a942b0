//! The cache store capability and its configuration.
//!
//! The pipeline never reaches for a global cache: a [`CacheStore`] is passed
//! in at construction. [`FsCacheStore`](crate::FsCacheStore) persists entries
//! across invocations and [`MemoryCacheStore`](crate::MemoryCacheStore) is a
//! drop-in double with the same contract.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use floe_common::ContentHash;

use crate::entry::{CacheCategory, CacheEntry, CacheInputs, MissReason};
use crate::error::CacheError;

/// Default staleness window: 30 days.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Location and staleness policy for a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Root directory holding one subdirectory per category.
    pub root: PathBuf,
    /// Entries older than this are treated as misses.
    pub staleness: Duration,
}

impl CacheConfig {
    /// Creates a config rooted at `root` with the default staleness window.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            staleness: DEFAULT_STALENESS,
        }
    }

    /// Overrides the staleness window.
    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    /// Staleness window expressed in whole days.
    pub fn with_staleness_days(self, days: u32) -> Self {
        self.with_staleness(Duration::from_secs(u64::from(days) * 86_400))
    }
}

/// Result of a validated lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// A valid entry for exactly the queried inputs.
    Hit(CacheEntry),
    /// No usable entry, with the reason.
    Miss(MissReason),
}

impl CacheLookup {
    /// Returns the entry on a hit.
    pub fn hit(self) -> Option<CacheEntry> {
        match self {
            CacheLookup::Hit(entry) => Some(entry),
            CacheLookup::Miss(_) => None,
        }
    }
}

/// Usage of one category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryStats {
    /// Number of entries.
    pub count: usize,
    /// Total stored size in bytes.
    pub total_size: u64,
    /// Age of the oldest entry, if any.
    pub oldest_age: Option<Duration>,
}

/// Usage per category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Stats keyed by category; every category is present.
    pub categories: BTreeMap<CacheCategory, CategoryStats>,
}

impl CacheStats {
    /// Total number of entries across categories.
    pub fn total_count(&self) -> usize {
        self.categories.values().map(|s| s.count).sum()
    }
}

/// Key-value persistence for cache entries.
///
/// Reads validate before returning and never fail: anything wrong with a
/// stored record is a [`CacheLookup::Miss`]. Writes are atomic and idempotent.
/// Implementations are shared between concurrent invocations without locks;
/// last writer wins.
pub trait CacheStore: Send + Sync {
    /// Looks up `key`, requiring the stored inputs to equal `inputs`.
    fn get(
        &self,
        category: CacheCategory,
        key: &ContentHash,
        inputs: &CacheInputs,
    ) -> CacheLookup;

    /// Publishes `entry` under its own key.
    fn put(&self, category: CacheCategory, entry: &CacheEntry) -> Result<(), CacheError>;

    /// Removes one entry. Returns `true` if something was removed.
    fn delete(&self, category: CacheCategory, key: &ContentHash) -> Result<bool, CacheError>;

    /// Removes entries in `category` (or all categories), optionally only those
    /// older than `older_than`. Returns the number removed.
    fn clear(
        &self,
        category: Option<CacheCategory>,
        older_than: Option<Duration>,
    ) -> Result<usize, CacheError>;

    /// Reports usage per category.
    fn stats(&self) -> Result<CacheStats, CacheError>;

    /// Every parseable entry in `category`, newest first.
    fn entries(&self, category: CacheCategory) -> Result<Vec<CacheEntry>, CacheError>;

    /// At most `limit` of the most recently written entries in `category`,
    /// newest first.
    fn recent_entries(
        &self,
        category: CacheCategory,
        limit: usize,
    ) -> Result<Vec<CacheEntry>, CacheError> {
        let mut entries = self.entries(category)?;
        entries.truncate(limit);
        Ok(entries)
    }
}

/// Categories selected by an optional filter.
pub(crate) fn selected(category: Option<CacheCategory>) -> Vec<CacheCategory> {
    match category {
        Some(c) => vec![c],
        None => CacheCategory::ALL.to_vec(),
    }
}
