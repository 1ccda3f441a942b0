//! Error types for cache operations.

use std::path::PathBuf;

/// Errors that can occur during cache operations.
///
/// Cache errors are always recoverable: a failed read becomes a cache miss and
/// a failed write becomes a logged warning. Compilation proceeds either way.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An I/O error occurred while reading or writing cache files.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A stored entry could not be parsed as a cache record.
    #[error("corrupt cache entry at {path}: {reason}")]
    ReadCorruption {
        /// The entry file path.
        path: PathBuf,
        /// Description of the parse failure.
        reason: String,
    },

    /// An entry could not be published.
    #[error("failed to write cache entry {path}: {reason}")]
    WriteFailure {
        /// The destination path.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the serialization failure.
        reason: String,
    },
}
