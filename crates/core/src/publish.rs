//! Pushing maintained branches and tags to their remotes.

use tracing::info;

use crate::errors::GitError;
use crate::models::PushTarget;
use crate::vcs::Vcs;

/// Push every target in order, stopping at the first failure.
///
/// Returns the remotes that were pushed to.
pub async fn publish<V: Vcs>(vcs: &mut V, targets: &[PushTarget]) -> Result<Vec<String>, GitError> {
    let mut pushed = Vec::with_capacity(targets.len());
    for target in targets {
        vcs.push(&target.remote, &target.refspecs, target.force)
            .await?;
        info!(
            remote = %target.remote,
            refspecs = target.refspecs.len(),
            force = target.force,
            "published"
        );
        pushed.push(target.remote.clone());
    }
    Ok(pushed)
}
