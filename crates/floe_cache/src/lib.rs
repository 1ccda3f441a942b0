//! Content-addressed cache for compilation stage outputs.
//!
//! Every entry is keyed by the digest of its named inputs and carries those
//! inputs, so a lookup only succeeds when the stored inputs match the query
//! exactly. Corrupt or stale records are reported as misses, never as errors.

#![warn(missing_docs)]

pub mod entry;
pub mod error;
pub mod fs;
pub mod memory;
pub mod store;

pub use entry::{
    key_for, validate_entry, CacheCategory, CacheEntry, CacheInputs, MissReason,
    ENTRY_FORMAT_VERSION,
};
pub use error::CacheError;
pub use fs::FsCacheStore;
pub use memory::MemoryCacheStore;
pub use store::{
    CacheConfig, CacheLookup, CacheStats, CacheStore, CategoryStats, DEFAULT_STALENESS,
};
