//! Up-to-date checks that gate every rebuild.

use tracing::debug;

use crate::errors::GitError;
use crate::vcs::Vcs;

/// True when `target` already points at the same commit as `reference`.
///
/// Identical names short-circuit without touching the repository. A missing
/// `target` is simply stale; a missing `reference` is an error because there
/// is nothing to bring the target up to.
pub async fn is_up_to_date<V: Vcs>(
    vcs: &V,
    target: &str,
    reference: &str,
) -> Result<bool, GitError> {
    if target == reference {
        return Ok(true);
    }
    let wanted = vcs
        .resolve_commit(reference)
        .await?
        .ok_or_else(|| GitError::RefNotFound(reference.to_string()))?;
    let current = vcs.resolve_commit(target).await?;
    let fresh = current.as_ref() == Some(&wanted);
    debug!(target, reference, fresh, "checked freshness");
    Ok(fresh)
}
