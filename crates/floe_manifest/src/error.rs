//! Error types for manifest loading, validation, and resolution.

use floe_common::Interrupt;
use serde_json::Value;

use crate::types::{ManifestRef, Tier};

/// Failure of the external fetch collaborator.
///
/// Always fatal for the invocation: the core never substitutes stale data for
/// a failed fetch.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Nothing exists at the reference.
    #[error("manifest '{reference}' not found")]
    NotFound {
        /// The reference that could not be resolved.
        reference: ManifestRef,
    },

    /// An I/O error occurred while reading the manifest.
    #[error("failed to read manifest '{reference}': {source}")]
    Io {
        /// The reference being read.
        reference: ManifestRef,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The reference scheme is not handled by this fetcher.
    #[error("cannot fetch '{reference}': {reason}")]
    Unsupported {
        /// The rejected reference.
        reference: ManifestRef,
        /// Why the fetcher cannot handle it.
        reason: String,
    },

    /// The fetch was stopped by the deadline or by cancellation.
    #[error("fetch of '{reference}' interrupted: {interrupt}")]
    Interrupted {
        /// The reference being fetched.
        reference: ManifestRef,
        /// What stopped it.
        interrupt: Interrupt,
    },
}

/// Errors produced while resolving a product against its platform manifests.
///
/// Everything except [`ResolveError::Fetch`] belongs to the validation family:
/// fatal, never retried, and reported with the offending field.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// A plugin selection is not in the enterprise whitelist for its category.
    #[error(
        "plugin '{selected}' selected for 'plugins.{category}' is not approved (allowed: {allowed_list})",
        allowed_list = join_or_none(.allowed)
    )]
    Approval {
        /// Plugin category (e.g. `compute`).
        category: String,
        /// The rejected identifier.
        selected: String,
        /// Identifiers the enterprise approves for the category.
        allowed: Vec<String>,
    },

    /// A lower tier contradicts an immutable enterprise policy.
    #[error(
        "immutable policy 'governance.{policy}' is {enterprise_value} at enterprise tier; {tier} tier declares {domain_value}"
    )]
    PolicyOverride {
        /// Policy name.
        policy: String,
        /// Value fixed by the enterprise manifest.
        enterprise_value: Value,
        /// Conflicting value declared below the enterprise (domain or product tier).
        domain_value: Value,
        /// The tier that attempted the override.
        tier: Tier,
    },

    /// The domain does not list the product in `approved_products`.
    #[error("product '{product}' is not approved by domain '{domain}'")]
    ProductNotApproved {
        /// The product name.
        product: String,
        /// The domain manifest's name (or reference when unnamed).
        domain: String,
    },

    /// A manifest or product document is structurally invalid.
    #[error("schema error at '{path}': {reason}")]
    Schema {
        /// Field path of the offending declaration.
        path: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The fetch collaborator failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl ResolveError {
    /// Creates a [`ResolveError::Schema`].
    pub fn schema(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Schema {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable kind for reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Approval { .. } => "approval",
            Self::PolicyOverride { .. } => "policy_override",
            Self::ProductNotApproved { .. } => "product_not_approved",
            Self::Schema { .. } => "schema",
            Self::Fetch(_) => "fetch",
        }
    }

    /// Field path of the offending declaration, where one applies.
    pub fn field(&self) -> Option<String> {
        match self {
            Self::Approval { category, .. } => Some(format!("plugins.{category}")),
            Self::PolicyOverride { policy, .. } => Some(format!("governance.{policy}")),
            Self::ProductNotApproved { .. } => Some("approved_products".to_string()),
            Self::Schema { path, .. } => Some(path.clone()),
            Self::Fetch(_) => None,
        }
    }

    /// Returns `true` for the validation family (everything but fetch failures).
    pub fn is_validation(&self) -> bool {
        !matches!(self, Self::Fetch(_))
    }
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}
