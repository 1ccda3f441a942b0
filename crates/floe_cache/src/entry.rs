//! Cache entry records and their validation.
//!
//! Entries are stored as JSON:
//!
//! ```json
//! { "cache_key": "<hex-sha256>", "created_at": "<RFC3339>",
//!   "inputs": { "<name>": "<hex-sha256>" }, "payload": { } }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use floe_common::{ContentHash, ContentHasher};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Named input digests a cache entry was computed from.
pub type CacheInputs = BTreeMap<String, ContentHash>;

/// Cache partitions. Policy enforcement has no category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheCategory {
    /// Resolved profile/connection structures.
    Profiles,
    /// Loaded platform manifests and parsed project manifests.
    Manifests,
}

impl CacheCategory {
    /// Every category, in directory order.
    pub const ALL: [CacheCategory; 2] = [CacheCategory::Profiles, CacheCategory::Manifests];

    /// Directory name for the category.
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheCategory::Profiles => "profiles",
            CacheCategory::Manifests => "manifests",
        }
    }
}

impl fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "profiles" => Ok(CacheCategory::Profiles),
            "manifests" => Ok(CacheCategory::Manifests),
            other => Err(format!(
                "unknown cache category '{other}' (expected profiles or manifests)"
            )),
        }
    }
}

/// On-disk record format version.
///
/// Bump this when the record layout or any stage payload shape changes;
/// records written under another version are never served.
pub const ENTRY_FORMAT_VERSION: u32 = 1;

/// One cached stage output.
///
/// Never mutated after creation; re-caching always writes a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Record format the entry was written with. Absent in pre-versioned records.
    #[serde(default)]
    pub format_version: u32,
    /// Digest of `inputs`; also the storage key.
    pub cache_key: ContentHash,
    /// When the entry was produced.
    pub created_at: DateTime<Utc>,
    /// The inputs the payload is a pure function of.
    pub inputs: CacheInputs,
    /// Stage-specific output.
    pub payload: Value,
}

impl CacheEntry {
    /// Creates an entry keyed by the combined digest of `inputs`, stamped now.
    pub fn new(inputs: CacheInputs, payload: Value) -> Self {
        Self {
            format_version: ENTRY_FORMAT_VERSION,
            cache_key: key_for(&inputs),
            created_at: Utc::now(),
            inputs,
            payload,
        }
    }

    /// Age at `now`. Entries stamped in the future count as brand new.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Returns `true` if this entry carries the same inputs and payload as `other`.
    pub fn same_content(&self, other: &CacheEntry) -> bool {
        self.format_version == other.format_version
            && self.cache_key == other.cache_key
            && self.inputs == other.inputs
            && self.payload == other.payload
    }
}

/// The cache key for a set of named inputs.
pub fn key_for(inputs: &CacheInputs) -> ContentHash {
    ContentHasher::combine(inputs)
}

/// Why a lookup did not produce a usable entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissReason {
    /// Caching was disabled for this invocation.
    Disabled,
    /// No entry exists under the key.
    NotFound,
    /// The entry is older than the staleness window.
    Stale {
        /// Age of the rejected entry.
        age: Duration,
    },
    /// The stored record could not be parsed.
    Corrupt {
        /// Parse failure description.
        detail: String,
    },
    /// The record's key or inputs differ from the query.
    InputsMismatch,
    /// The record was written with a different record format.
    Incompatible {
        /// Format version found in the record.
        found: u32,
    },
}

impl MissReason {
    /// Short reason code for reports.
    pub fn code(&self) -> &'static str {
        match self {
            MissReason::Disabled => "no-cache",
            MissReason::NotFound => "not-found",
            MissReason::Stale { .. } => "stale",
            MissReason::Corrupt { .. } => "corrupt",
            MissReason::InputsMismatch => "inputs-mismatch",
            MissReason::Incompatible { .. } => "incompatible",
        }
    }
}

impl fmt::Display for MissReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissReason::Stale { age } => {
                write!(f, "stale (age {}d)", age.as_secs() / 86_400)
            }
            MissReason::Corrupt { detail } => write!(f, "corrupt ({detail})"),
            MissReason::Incompatible { found } => write!(f, "incompatible (format {found})"),
            other => f.write_str(other.code()),
        }
    }
}

/// Checks a stored entry against the query that found it.
pub fn validate_entry(
    entry: &CacheEntry,
    key: &ContentHash,
    inputs: &CacheInputs,
    now: DateTime<Utc>,
    staleness: Duration,
) -> Result<(), MissReason> {
    if entry.format_version != ENTRY_FORMAT_VERSION {
        return Err(MissReason::Incompatible {
            found: entry.format_version,
        });
    }
    if entry.cache_key != *key || entry.inputs != *inputs {
        return Err(MissReason::InputsMismatch);
    }
    let age = entry.age_at(now);
    if age > staleness {
        return Err(MissReason::Stale { age });
    }
    Ok(())
}
