//! Data models shared across branchsync.
//!
//! Branch relationships are described by typed specs that the configuration
//! layer validates once at load time. A run produces a [`SyncReport`]; the
//! read-only status query produces [`BranchStatus`] rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Branch specs
// ---------------------------------------------------------------------------

/// A branch that tracks a single upstream ref 1:1.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MirrorSpec {
    /// Local branch to keep in sync.
    pub branch: String,
    /// Ref the branch is reset to when stale.
    pub upstream: String,
    /// Follow the newest matching commit on `upstream` instead of its tip.
    #[serde(default)]
    pub filter: Option<CommitFilter>,
}

/// Selects the newest commit on a ref that matches every given criterion.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitFilter {
    /// Author name or email substring.
    #[serde(default)]
    pub author: Option<String>,
    /// Only commits touching this path.
    #[serde(default)]
    pub path: Option<String>,
    /// Skip merge commits (default true).
    #[serde(default = "default_true")]
    pub no_merges: bool,
}

fn default_true() -> bool {
    true
}

/// A tag that is force-moved to `target` whenever it falls behind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagSpec {
    pub name: String,
    pub target: String,
}

/// A branch fed by two maintainer working branches that are expected to be
/// ancestor-related, with a canonical ref to fall back on when they are not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardSpec {
    pub branch: String,
    pub primary: String,
    pub secondary: String,
    pub canonical: String,
}

/// A top-level branch and the ref holding its published equivalent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopLevelSpec {
    pub branch: String,
    pub upstream: String,
}

/// Which tier an integration branch belongs to. Testing branches are built
/// before queue branches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Testing,
    Queue,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Testing => write!(f, "testing"),
            Self::Queue => write!(f, "queue"),
        }
    }
}

/// An integration branch rebuilt from a baseline plus ordered merges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchSpec {
    /// Target branch name.
    #[serde(rename = "branch")]
    pub name: String,
    /// Ref the branch is hard-reset to before merging.
    pub baseline: String,
    /// Refs merged in order on top of the baseline.
    pub sources: Vec<String>,
    /// Filled in from the config table the spec was declared in.
    #[serde(skip, default = "default_tier")]
    pub tier: Tier,
}

fn default_tier() -> Tier {
    Tier::Testing
}

/// One merge of a rebuild: `source` is merged into whatever `onto` names.
///
/// The first step of a spec merges onto the baseline; later steps merge onto
/// the result of the previous step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeStep {
    pub onto: String,
    pub source: String,
}

impl BranchSpec {
    /// The sequential merge steps this spec performs.
    pub fn steps(&self) -> Vec<MergeStep> {
        self.sources
            .iter()
            .enumerate()
            .map(|(i, source)| MergeStep {
                onto: if i == 0 {
                    self.baseline.clone()
                } else {
                    self.name.clone()
                },
                source: source.clone(),
            })
            .collect()
    }

    /// Every ref this spec reads.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.baseline.as_str()).chain(self.sources.iter().map(String::as_str))
    }
}

/// A set of refspecs pushed to one remote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushTarget {
    pub remote: String,
    pub refspecs: Vec<String>,
    #[serde(default)]
    pub force: bool,
}

/// The validated description of everything a run maintains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub mirrors: Vec<MirrorSpec>,
    pub tags: Vec<TagSpec>,
    pub forwards: Vec<ForwardSpec>,
    pub top_level: Vec<TopLevelSpec>,
    /// Integration branches in build order (testing tier first).
    pub integration: Vec<BranchSpec>,
    pub publish: Vec<PushTarget>,
}

// ---------------------------------------------------------------------------
// Run results
// ---------------------------------------------------------------------------

/// A non-fatal condition noticed during a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncWarning {
    /// Neither maintainer branch contains the other; `fallback` was used.
    DivergedBranches {
        primary: String,
        secondary: String,
        fallback: String,
    },
    /// The restore point could not be checked out because an operation is
    /// still pending in the work tree.
    RestoreSkipped { branch: String, reason: String },
}

impl std::fmt::Display for SyncWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DivergedBranches {
                primary,
                secondary,
                fallback,
            } => write!(
                f,
                "{primary} and {secondary} diverged; using {fallback} as the baseline"
            ),
            Self::RestoreSkipped { branch, reason } => {
                write!(f, "left '{branch}' unrestored: {reason}")
            }
        }
    }
}

/// Summary of one synchronization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Branch checked out when the run started.
    pub restore_point: String,
    /// Mirrors that were reset to their upstream.
    pub refreshed: Vec<String>,
    /// Tags that were force-moved.
    pub tags_moved: Vec<String>,
    /// Forward branches that were rebased.
    pub forwarded: Vec<String>,
    /// Integration branches rebuilt, in build order.
    pub rebuilt: Vec<String>,
    /// Top-level branches whose commit changed during the run.
    pub changed: Vec<String>,
    /// True when every top-level branch was already current.
    pub rebuild_skipped: bool,
    /// Whether the restore point is checked out again.
    pub restored: bool,
    pub warnings: Vec<SyncWarning>,
}

impl SyncReport {
    pub fn new(restore_point: impl Into<String>) -> Self {
        Self {
            started_at: Utc::now(),
            completed_at: None,
            restore_point: restore_point.into(),
            refreshed: Vec::new(),
            tags_moved: Vec::new(),
            forwarded: Vec::new(),
            rebuilt: Vec::new(),
            changed: Vec::new(),
            rebuild_skipped: false,
            restored: false,
            warnings: Vec::new(),
        }
    }

    /// Whether the run touched any branch or tag.
    pub fn is_noop(&self) -> bool {
        self.refreshed.is_empty()
            && self.tags_moved.is_empty()
            && self.forwarded.is_empty()
            && self.rebuilt.is_empty()
    }
}

/// Kind of entry in a status listing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BranchRole {
    Mirror,
    Tag,
    Forward,
    TopLevel,
}

impl std::fmt::Display for BranchRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mirror => write!(f, "mirror"),
            Self::Tag => write!(f, "tag"),
            Self::Forward => write!(f, "forward"),
            Self::TopLevel => write!(f, "top-level"),
        }
    }
}

/// One row of the read-only status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchStatus {
    pub name: String,
    pub role: BranchRole,
    /// The ref the entry is compared against.
    pub reference: String,
    pub up_to_date: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}
