//! Conflict settlement policy.
//!
//! Paths deleted on the checked-out side are resolved by honoring the
//! deletion. Every other path is offered to the recorded-resolution cache.
//! Whatever the cache cannot settle is left for a human.

use tracing::{debug, info};

use crate::errors::GitError;
use crate::vcs::{ConflictKind, ConflictedPath, Vcs};

/// Result of settling one batch of conflicts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Every path is resolved and staged.
    Resolved {
        removed: Vec<String>,
        replayed: Vec<String>,
    },
    /// These paths still carry conflicts.
    Unresolved(Vec<String>),
}

/// Split conflicts into paths deleted by our side and everything else.
pub fn partition(conflicts: Vec<ConflictedPath>) -> (Vec<String>, Vec<String>) {
    let (deleted, rest): (Vec<_>, Vec<_>) = conflicts
        .into_iter()
        .partition(|c| c.kind == ConflictKind::DeletedByUs);
    (
        deleted.into_iter().map(|c| c.path).collect(),
        rest.into_iter().map(|c| c.path).collect(),
    )
}

/// Apply the settlement policy to `conflicts` in the pending operation.
pub async fn settle<V: Vcs>(
    vcs: &mut V,
    conflicts: Vec<ConflictedPath>,
) -> Result<Settlement, GitError> {
    let (deleted, others) = partition(conflicts);

    for path in &deleted {
        vcs.remove_path(path).await?;
        debug!(path = %path, "honored deletion on our side");
    }

    let still = vcs.replay_recorded_resolutions(&others).await?;
    if !still.is_empty() {
        info!(count = still.len(), "conflicts left without a recorded resolution");
        return Ok(Settlement::Unresolved(still));
    }

    Ok(Settlement::Resolved {
        removed: deleted,
        replayed: others,
    })
}
