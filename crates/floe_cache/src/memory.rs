//! In-memory cache store.
//!
//! Holds serialized records rather than live values so that reads go through
//! the same parse-and-validate path as [`FsCacheStore`](crate::FsCacheStore).

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;
use floe_common::ContentHash;

use crate::entry::{validate_entry, CacheCategory, CacheEntry, CacheInputs, MissReason};
use crate::error::CacheError;
use crate::store::{selected, CacheConfig, CacheLookup, CacheStats, CacheStore, CategoryStats};

type Records = BTreeMap<(CacheCategory, ContentHash), String>;

/// Volatile cache store for tests and single-shot runs.
pub struct MemoryCacheStore {
    staleness: Duration,
    records: RwLock<Records>,
}

impl MemoryCacheStore {
    /// Creates an empty store with the staleness window from `config`.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            staleness: config.staleness,
            records: RwLock::new(Records::new()),
        }
    }

    /// Stores raw record text, bypassing serialization.
    pub fn insert_raw(&self, category: CacheCategory, key: ContentHash, raw: impl Into<String>) {
        self.write().insert((category, key), raw.into());
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // A poisoned lock still holds consistent strings; recover the guard.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Records> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Records> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }

    fn parsed(&self, category: CacheCategory) -> Vec<CacheEntry> {
        self.read()
            .iter()
            .filter(|((c, _), _)| *c == category)
            .filter_map(|(_, raw)| serde_json::from_str(raw).ok())
            .collect()
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self {
            staleness: crate::store::DEFAULT_STALENESS,
            records: RwLock::new(Records::new()),
        }
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(
        &self,
        category: CacheCategory,
        key: &ContentHash,
        inputs: &CacheInputs,
    ) -> CacheLookup {
        let raw = match self.read().get(&(category, *key)) {
            Some(raw) => raw.clone(),
            None => return CacheLookup::Miss(MissReason::NotFound),
        };
        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                return CacheLookup::Miss(MissReason::Corrupt {
                    detail: e.to_string(),
                });
            }
        };
        match validate_entry(&entry, key, inputs, Utc::now(), self.staleness) {
            Ok(()) => CacheLookup::Hit(entry),
            Err(reason) => CacheLookup::Miss(reason),
        }
    }

    fn put(&self, category: CacheCategory, entry: &CacheEntry) -> Result<(), CacheError> {
        let slot = (category, entry.cache_key);
        let mut records = self.write();
        if let Some(existing) = records
            .get(&slot)
            .and_then(|raw| serde_json::from_str::<CacheEntry>(raw).ok())
        {
            if existing.same_content(entry) {
                return Ok(());
            }
        }
        let raw = serde_json::to_string(entry).map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;
        records.insert(slot, raw);
        Ok(())
    }

    fn delete(&self, category: CacheCategory, key: &ContentHash) -> Result<bool, CacheError> {
        Ok(self.write().remove(&(category, *key)).is_some())
    }

    fn clear(
        &self,
        category: Option<CacheCategory>,
        older_than: Option<Duration>,
    ) -> Result<usize, CacheError> {
        let now = Utc::now();
        let categories = selected(category);
        let mut records = self.write();
        let before = records.len();
        records.retain(|(c, _), raw| {
            if !categories.contains(c) {
                return true;
            }
            match older_than {
                None => false,
                Some(limit) => serde_json::from_str::<CacheEntry>(raw)
                    .map_or(false, |entry| entry.age_at(now) <= limit),
            }
        });
        Ok(before - records.len())
    }

    fn stats(&self) -> Result<CacheStats, CacheError> {
        let now = Utc::now();
        let mut stats = CacheStats::default();
        for category in CacheCategory::ALL {
            stats.categories.insert(category, CategoryStats::default());
        }
        for ((category, _), raw) in self.read().iter() {
            let cat = stats.categories.entry(*category).or_default();
            cat.count += 1;
            cat.total_size += raw.len() as u64;
            if let Ok(entry) = serde_json::from_str::<CacheEntry>(raw) {
                let age = entry.age_at(now);
                cat.oldest_age = Some(cat.oldest_age.map_or(age, |old| old.max(age)));
            }
        }
        Ok(stats)
    }

    fn entries(&self, category: CacheCategory) -> Result<Vec<CacheEntry>, CacheError> {
        let mut entries = self.parsed(category);
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }
}
