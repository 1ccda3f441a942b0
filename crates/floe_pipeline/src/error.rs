//! Error types for the compilation pipeline.

use std::path::PathBuf;

use floe_common::Interrupt;
use floe_manifest::{FetchError, ResolveError};

use crate::producer::Violation;
use crate::stage::Stage;

/// Failure reported by a stage producer collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    /// The producer could not build its output.
    #[error("{reason}")]
    Failed {
        /// What went wrong.
        reason: String,
    },

    /// The producer stopped at a deadline or cancellation checkpoint.
    #[error(transparent)]
    Interrupted(#[from] Interrupt),
}

impl ProducerError {
    /// Creates a [`ProducerError::Failed`].
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// Fatal errors that abort a compile invocation.
///
/// Cache failures never appear here: the pipeline degrades them to misses and
/// warnings.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Manifest loading, validation, or resolution failed.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// A stage producer failed.
    #[error("stage {} ({}) failed: {source}", .stage.number(), .stage.name())]
    Producer {
        /// The failing stage.
        stage: Stage,
        /// The producer's error.
        source: ProducerError,
    },

    /// A project source file could not be read.
    #[error("failed to read project source {path}: {source}")]
    Source {
        /// The unreadable path.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A project source file is not valid UTF-8.
    #[error("project source {path} is not valid UTF-8 at byte {valid_up_to}")]
    SourceEncoding {
        /// The offending file.
        path: PathBuf,
        /// Length of the valid prefix.
        valid_up_to: usize,
    },

    /// The invocation hit its deadline or was cancelled.
    #[error("stage {} ({}) interrupted: {interrupt}", .stage.number(), .stage.name())]
    Interrupted {
        /// The stage that was running.
        stage: Stage,
        /// What stopped it.
        interrupt: Interrupt,
    },

    /// Governance enforcement reported violations.
    #[error("policy enforcement failed with {} violation(s)", .violations.len())]
    Enforcement {
        /// Every violation found.
        violations: Vec<Violation>,
    },
}

impl PipelineError {
    /// Wraps a producer failure, lifting interrupts to [`PipelineError::Interrupted`].
    pub fn producer(stage: Stage, err: ProducerError) -> Self {
        match err {
            ProducerError::Interrupted(interrupt) => Self::Interrupted { stage, interrupt },
            source => Self::Producer { stage, source },
        }
    }

    /// Stable machine-readable kind for reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Resolve(ResolveError::Fetch(FetchError::Interrupted { interrupt, .. })) => {
                interrupt_kind(*interrupt)
            }
            Self::Resolve(e) => e.kind(),
            Self::Producer { .. } => "producer",
            Self::Source { .. } => "fetch",
            Self::SourceEncoding { .. } => "source_encoding",
            Self::Interrupted { interrupt, .. } => interrupt_kind(*interrupt),
            Self::Enforcement { .. } => "enforcement",
        }
    }

    /// Field path of the offending declaration, where one applies.
    pub fn field(&self) -> Option<String> {
        match self {
            Self::Resolve(e) => e.field(),
            Self::Enforcement { violations } => violations
                .first()
                .map(|v| format!("governance.{}", v.policy)),
            Self::Source { path, .. } | Self::SourceEncoding { path, .. } => {
                Some(path.display().to_string())
            }
            Self::Producer { .. } | Self::Interrupted { .. } => None,
        }
    }

    /// Process exit status for this failure.
    ///
    /// `1` for validation and enforcement failures, `2` for I/O, fetch, and
    /// interrupted invocations.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Resolve(e) if e.is_validation() => 1,
            Self::Producer { .. } | Self::Enforcement { .. } | Self::SourceEncoding { .. } => 1,
            Self::Resolve(_) | Self::Source { .. } | Self::Interrupted { .. } => 2,
        }
    }
}

fn interrupt_kind(interrupt: Interrupt) -> &'static str {
    match interrupt {
        Interrupt::DeadlineExceeded => "deadline",
        Interrupt::Cancelled => "cancelled",
    }
}
