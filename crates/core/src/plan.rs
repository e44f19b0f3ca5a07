//! Branch rebuild plan executor.
//!
//! An integration branch is rebuilt from scratch every time: hard-reset to
//! its baseline, then each source merged in declaration order. A source
//! merged later sees the (possibly conflict-resolved) result of the ones
//! before it.

use tracing::{debug, info, info_span, instrument, Instrument};

use crate::conflict::{merge_with_replay, MergeClassification};
use crate::errors::{GitError, SyncError};
use crate::models::BranchSpec;
use crate::vcs::Vcs;

/// What happened while rebuilding one branch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildOutcome {
    pub branch: String,
    /// Sources whose merge needed recorded resolutions or deletions.
    pub auto_resolved: Vec<String>,
}

/// True when the branch already contains its baseline and every source, so
/// a rebuild would only add redundant merge commits. A missing branch is
/// never current.
pub async fn is_current<V: Vcs>(vcs: &V, spec: &BranchSpec) -> Result<bool, GitError> {
    if vcs.resolve_commit(&spec.name).await?.is_none() {
        return Ok(false);
    }
    for dep in spec.dependencies() {
        if !vcs.is_ancestor(dep, &spec.name).await? {
            debug!(branch = %spec.name, missing = dep, "integration branch is stale");
            return Ok(false);
        }
    }
    Ok(true)
}

/// Rebuild `spec.name` from its baseline and sources.
///
/// Stops at the first merge that needs a human and reports it as
/// [`SyncError::MergeConflictUnresolved`]; the merge is left uncommitted.
#[instrument(skip(vcs, spec), fields(branch = %spec.name, tier = %spec.tier))]
pub async fn rebuild<V: Vcs>(vcs: &mut V, spec: &BranchSpec) -> Result<RebuildOutcome, SyncError> {
    vcs.checkout(Some(&spec.name)).await?;
    vcs.reset_hard(&spec.baseline).await?;
    info!(baseline = %spec.baseline, "reset to baseline");

    let mut outcome = RebuildOutcome {
        branch: spec.name.clone(),
        ..Default::default()
    };

    for step in spec.steps() {
        let span = info_span!("merge", source = %step.source, onto = %step.onto);
        match merge_with_replay(vcs, &step.source).instrument(span).await? {
            MergeClassification::Clean => {}
            MergeClassification::AutoResolved { .. } => {
                outcome.auto_resolved.push(step.source.clone());
            }
            MergeClassification::NeedsHuman { paths } => {
                return Err(SyncError::MergeConflictUnresolved {
                    branch: spec.name.clone(),
                    source_ref: step.source,
                    paths,
                });
            }
        }
    }

    info!(sources = spec.sources.len(), "rebuilt");
    Ok(outcome)
}
