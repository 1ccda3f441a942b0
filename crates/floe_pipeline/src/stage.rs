//! Pipeline stages and per-stage reports.

use std::fmt;
use std::time::Duration;

use floe_cache::{CacheCategory, MissReason};

/// The four compilation stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Fetch and validate platform manifests.
    ManifestLoad,
    /// Resolve tiers and build the connection profile.
    ProfileResolve,
    /// Parse the transformation project.
    ProjectParse,
    /// Enforce governance against the parsed project.
    PolicyEnforce,
}

impl Stage {
    /// Every stage in execution order.
    pub const ALL: [Stage; 4] = [
        Stage::ManifestLoad,
        Stage::ProfileResolve,
        Stage::ProjectParse,
        Stage::PolicyEnforce,
    ];

    /// One-based position in the pipeline.
    pub fn number(&self) -> u8 {
        match self {
            Stage::ManifestLoad => 1,
            Stage::ProfileResolve => 2,
            Stage::ProjectParse => 3,
            Stage::PolicyEnforce => 4,
        }
    }

    /// Display name.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::ManifestLoad => "Manifest-Load",
            Stage::ProfileResolve => "Profile-Resolve",
            Stage::ProjectParse => "Project-Parse",
            Stage::PolicyEnforce => "Policy-Enforce",
        }
    }

    /// Cache partition for the stage's output. Policy enforcement has none.
    pub fn cache_category(&self) -> Option<CacheCategory> {
        match self {
            Stage::ManifestLoad | Stage::ProjectParse => Some(CacheCategory::Manifests),
            Stage::ProfileResolve => Some(CacheCategory::Profiles),
            Stage::PolicyEnforce => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a stage obtained its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// Served from the cache.
    Hit,
    /// Produced and (if possible) cached.
    Miss,
    /// Produced without consulting the cache.
    Executed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageStatus::Hit => "HIT",
            StageStatus::Miss => "MISS",
            StageStatus::Executed => "EXECUTED",
        })
    }
}

/// Why a cached stage missed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageReason {
    /// The store rejected or lacked the entry.
    Lookup(MissReason),
    /// An earlier entry of the same shape exists; these inputs differ from it.
    Changed(Vec<String>),
}

impl fmt::Display for StageReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageReason::Lookup(reason) => fmt::Display::fmt(reason, f),
            StageReason::Changed(names) => write!(f, "changed: {}", names.join(", ")),
        }
    }
}

/// Outcome of one stage in one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    /// The stage.
    pub stage: Stage,
    /// How its output was obtained.
    pub status: StageStatus,
    /// Wall time spent in the stage.
    pub duration: Duration,
    /// Miss reason, present only for [`StageStatus::Miss`].
    pub reason: Option<StageReason>,
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stage {}: {} [{}] ({:.2?})",
            self.stage.number(),
            self.stage.name(),
            self.status,
            self.duration
        )?;
        if let Some(reason) = &self.reason {
            write!(f, " {reason}")?;
        }
        Ok(())
    }
}
