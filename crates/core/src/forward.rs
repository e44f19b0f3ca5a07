//! Forward-branch reconciler.
//!
//! A forward branch carries local commits on top of whichever of two
//! maintainer branches is newest. Planning is read-only and decides the
//! baseline; applying rebases only when the branch does not already contain
//! it.

use tracing::{debug, info, instrument, warn};

use crate::ancestry::{latest_of3, Selection};
use crate::conflict::{settle, Settlement};
use crate::errors::SyncError;
use crate::models::ForwardSpec;
use crate::vcs::{MergeOutcome, Vcs};

/// Read-only decision for one forward branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardPlan {
    pub branch: String,
    pub selection: Selection,
    /// False when the branch already contains the chosen baseline.
    pub needs_rebase: bool,
}

/// Choose the baseline for `spec` and check whether the branch contains it.
pub async fn plan<V: Vcs>(vcs: &V, spec: &ForwardSpec) -> Result<ForwardPlan, SyncError> {
    let selection = latest_of3(vcs, &spec.primary, &spec.secondary, &spec.canonical).await?;
    let needs_rebase = !vcs.is_ancestor(&selection.chosen, &spec.branch).await?;
    debug!(
        branch = %spec.branch,
        baseline = %selection.chosen,
        needs_rebase,
        "planned forward branch"
    );
    Ok(ForwardPlan {
        branch: spec.branch.clone(),
        selection,
        needs_rebase,
    })
}

/// Bring the branch on top of the planned baseline.
///
/// Containment is checked again first, so applying a plan twice is harmless.
/// Returns whether a rebase happened. Each commit that stops on conflicts is
/// settled the same way merges are; anything left unresolved halts with
/// [`SyncError::RebaseConflictUnresolved`] and the rebase stays stopped.
#[instrument(skip(vcs, plan), fields(branch = %plan.branch, onto = %plan.selection.chosen))]
pub async fn apply<V: Vcs>(vcs: &mut V, plan: &ForwardPlan) -> Result<bool, SyncError> {
    let onto = &plan.selection.chosen;
    if vcs.is_ancestor(onto, &plan.branch).await? {
        debug!("already contains baseline");
        return Ok(false);
    }

    let mut outcome = vcs.rebase_onto(onto, &plan.branch).await?;
    while let MergeOutcome::Conflicted(conflicts) = outcome {
        if !conflicts.is_empty() {
            if let Settlement::Unresolved(paths) = settle(vcs, conflicts).await? {
                warn!(paths = ?paths, "rebase needs manual resolution");
                return Err(SyncError::RebaseConflictUnresolved {
                    branch: plan.branch.clone(),
                    onto: onto.clone(),
                    paths,
                });
            }
        }
        outcome = vcs.continue_rebase().await?;
    }

    info!("rebased onto new baseline");
    Ok(true)
}
