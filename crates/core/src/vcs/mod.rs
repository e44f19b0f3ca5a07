//! Version-control adapter.
//!
//! [`Vcs`] is the only way the rest of the crate touches a repository. The
//! engine owns one adapter by value and lends it out, so reads borrow it
//! shared and every mutation borrows it exclusively.

pub mod git;
#[cfg(test)]
pub(crate) mod memory;

use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::GitError;
use crate::models::CommitFilter;

pub use git::GitCli;

/// Validated, full-length hex object name (SHA-1 or SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitId(String);

fn object_id_re() -> Result<&'static Regex, GitError> {
    static RE: OnceLock<Result<Regex, String>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:[0-9a-fA-F]{40}|[0-9a-fA-F]{64})$").map_err(|e| e.to_string())
    })
    .as_ref()
    .map_err(|e| GitError::InvalidObjectId(format!("object id pattern: {e}")))
}

impl CommitId {
    /// Parse git output into a commit id, normalizing to lowercase.
    pub fn parse(raw: &str) -> Result<Self, GitError> {
        let trimmed = raw.trim();
        if object_id_re()?.is_match(trimmed) {
            Ok(Self(trimmed.to_ascii_lowercase()))
        } else {
            Err(GitError::InvalidObjectId(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CommitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<git2::Oid> for CommitId {
    fn from(oid: git2::Oid) -> Self {
        Self(oid.to_string())
    }
}

/// How a single path ended up conflicted, named from the checked-out side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    BothModified,
    BothAdded,
    BothDeleted,
    /// Removed on the checked-out branch, modified on the incoming side.
    DeletedByUs,
    /// Modified on the checked-out branch, removed on the incoming side.
    DeletedByThem,
    AddedByUs,
    AddedByThem,
}

impl ConflictKind {
    /// Classify from which index stages (base, ours, theirs) are present.
    pub fn from_stages(base: bool, ours: bool, theirs: bool) -> Self {
        match (base, ours, theirs) {
            (true, false, true) => Self::DeletedByUs,
            (true, true, false) => Self::DeletedByThem,
            (false, true, true) => Self::BothAdded,
            (false, true, false) => Self::AddedByUs,
            (false, false, true) => Self::AddedByThem,
            (true, false, false) => Self::BothDeleted,
            _ => Self::BothModified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictedPath {
    pub path: String,
    pub kind: ConflictKind,
}

impl ConflictedPath {
    pub fn new(path: impl Into<String>, kind: ConflictKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Result of a merge or of one rebase step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Clean,
    /// The operation stopped with these paths still unmerged. The list may be
    /// empty when the resolution cache already settled every conflict and
    /// only the commit is outstanding.
    Conflicted(Vec<ConflictedPath>),
}

/// Primitives the synchronization engine needs from version control.
///
/// Every mutating call either completes or leaves a well-defined pending
/// state: a conflicted merge stays uncommitted until the caller settles it
/// and calls [`commit_merge`](Vcs::commit_merge), a conflicted rebase stays
/// stopped until [`continue_rebase`](Vcs::continue_rebase).
#[allow(async_fn_in_trait)]
pub trait Vcs {
    /// Refresh every remote-tracking ref, pruning stale ones.
    async fn update_remotes(&mut self) -> Result<(), GitError>;

    /// Resolve a ref to its commit, `None` when it does not exist.
    async fn resolve_commit(&self, reference: &str) -> Result<Option<CommitId>, GitError>;

    /// True iff `ancestor` is reachable from `descendant` (reflexive).
    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitError>;

    /// Name of the pending operation (merge, rebase, ...) if any.
    async fn operation_in_progress(&self) -> Result<Option<String>, GitError>;

    /// Check out `branch` and return what was checked out before. With
    /// `None` nothing changes and the current branch is returned; that
    /// fails with [`GitError::NotOnBranch`] on a detached HEAD.
    async fn checkout(&mut self, branch: Option<&str>) -> Result<String, GitError>;

    /// Force the current branch and work tree to `reference`.
    async fn reset_hard(&mut self, reference: &str) -> Result<(), GitError>;

    /// Merge `source` into the current branch, always recording a merge commit.
    async fn merge_no_ff(&mut self, source: &str) -> Result<MergeOutcome, GitError>;

    /// Resolve a conflicted path by deleting it from the work tree and index.
    async fn remove_path(&mut self, path: &str) -> Result<(), GitError>;

    /// Apply cached resolutions to `paths`; returns those still unresolved.
    async fn replay_recorded_resolutions(
        &mut self,
        paths: &[String],
    ) -> Result<Vec<String>, GitError>;

    /// Commit a merge whose conflicts are all settled.
    async fn commit_merge(&mut self) -> Result<(), GitError>;

    /// Replay the commits unique to `branch` on top of `new_base`.
    async fn rebase_onto(&mut self, new_base: &str, branch: &str)
        -> Result<MergeOutcome, GitError>;

    /// Continue a stopped rebase after its conflicts are settled.
    async fn continue_rebase(&mut self) -> Result<MergeOutcome, GitError>;

    async fn tag_force(&mut self, name: &str, target: &str) -> Result<(), GitError>;

    async fn push(&mut self, remote: &str, refspecs: &[String], force: bool)
        -> Result<(), GitError>;

    /// Newest commit on `reference` matching `filter`.
    async fn newest_matching(
        &self,
        reference: &str,
        filter: &CommitFilter,
    ) -> Result<Option<CommitId>, GitError>;
}
