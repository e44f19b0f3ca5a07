//! Conflict-replay merge step.
//!
//! Merges one source into the checked-out branch without fast-forwarding.
//! Conflicts are settled through [`settle`]; when that leaves anything
//! unresolved the merge stays uncommitted so the operator can finish it in
//! place.

use tracing::{info, warn};

use super::resolver::{settle, Settlement};
use crate::errors::GitError;
use crate::vcs::{MergeOutcome, Vcs};

/// Classification of a single merge step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeClassification {
    Clean,
    AutoResolved {
        removed: Vec<String>,
        replayed: Vec<String>,
    },
    /// Nothing was committed; these paths are still conflicted.
    NeedsHuman { paths: Vec<String> },
}

/// Merge `source` into the current branch, replaying recorded resolutions.
pub async fn merge_with_replay<V: Vcs>(
    vcs: &mut V,
    source: &str,
) -> Result<MergeClassification, GitError> {
    let conflicts = match vcs.merge_no_ff(source).await? {
        MergeOutcome::Clean => return Ok(MergeClassification::Clean),
        MergeOutcome::Conflicted(conflicts) => conflicts,
    };

    match settle(vcs, conflicts).await? {
        Settlement::Resolved { removed, replayed } => {
            vcs.commit_merge().await?;
            info!(
                source,
                removed = removed.len(),
                replayed = replayed.len(),
                "merge auto-resolved"
            );
            Ok(MergeClassification::AutoResolved { removed, replayed })
        }
        Settlement::Unresolved(paths) => {
            warn!(source, paths = ?paths, "merge needs manual resolution");
            Ok(MergeClassification::NeedsHuman { paths })
        }
    }
}
