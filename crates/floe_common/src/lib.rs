//! Shared foundational types used across the Floe compilation core.
//!
//! This crate provides SHA-256 content hashes, canonical hashing of
//! structured values, and the deadline/cancellation context threaded through
//! every pipeline stage.

#![warn(missing_docs)]

pub mod context;
pub mod hash;
pub mod hasher;

pub use context::{CancelToken, Deadline, Interrupt, StageContext};
pub use hash::{ContentHash, ParseHashError};
pub use hasher::{ContentHasher, HashError};
