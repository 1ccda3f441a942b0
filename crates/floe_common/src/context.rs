//! Deadlines and cooperative cancellation for blocking stage work.
//!
//! A [`StageContext`] is handed to every fetcher and stage producer. Producers
//! call [`StageContext::checkpoint`] between units of work; the pipeline calls
//! it again before publishing anything to the cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why in-flight work must stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Interrupt {
    /// The caller-supplied deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// The caller cancelled the invocation.
    #[error("cancelled")]
    Cancelled,
}

/// A point in time after which stage work must fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// A deadline that never expires.
    pub fn none() -> Self {
        Self { at: None }
    }

    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(timeout),
        }
    }

    /// A deadline at a fixed instant.
    pub fn at(instant: Instant) -> Self {
        Self { at: Some(instant) }
    }

    /// Returns `true` once the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left before expiry, or `None` for an unbounded deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every holder of this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Deadline plus cancellation, passed top-down through one compile invocation.
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    /// Expiry for the whole invocation.
    pub deadline: Deadline,
    /// Cancellation flag shared with the caller.
    pub cancel: CancelToken,
}

impl StageContext {
    /// Creates a context from a deadline and a cancellation token.
    pub fn new(deadline: Deadline, cancel: CancelToken) -> Self {
        Self { deadline, cancel }
    }

    /// Returns an error if work should stop. Cancellation wins over expiry.
    pub fn checkpoint(&self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        if self.deadline.is_expired() {
            return Err(Interrupt::DeadlineExceeded);
        }
        Ok(())
    }
}
