//! Ancestry oracle: which of two refs is newer, or have they diverged.

use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::GitError;
use crate::models::SyncWarning;
use crate::vcs::Vcs;

/// Positional verdict of [`latest`]: "left" is the first argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceVerdict {
    LeftNewer,
    RightNewer,
    Diverged,
}

/// Compare two refs. Equal commits report [`DivergenceVerdict::RightNewer`].
pub async fn latest<V: Vcs>(
    vcs: &V,
    left: &str,
    right: &str,
) -> Result<DivergenceVerdict, GitError> {
    let verdict = if vcs.is_ancestor(left, right).await? {
        DivergenceVerdict::RightNewer
    } else if vcs.is_ancestor(right, left).await? {
        DivergenceVerdict::LeftNewer
    } else {
        DivergenceVerdict::Diverged
    };
    debug!(left, right, ?verdict, "compared refs");
    Ok(verdict)
}

/// Outcome of [`latest_of3`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Ref to use as the new baseline.
    pub chosen: String,
    pub verdict: DivergenceVerdict,
    /// Set when the canonical fallback was taken.
    pub warning: Option<SyncWarning>,
}

impl Selection {
    pub fn fell_back(&self) -> bool {
        self.verdict == DivergenceVerdict::Diverged
    }
}

/// Pick the newer of `primary` and `secondary`, or `canonical` when they
/// have diverged. The fallback is logged and carried as a warning; it never
/// fails the run.
pub async fn latest_of3<V: Vcs>(
    vcs: &V,
    primary: &str,
    secondary: &str,
    canonical: &str,
) -> Result<Selection, GitError> {
    let verdict = latest(vcs, primary, secondary).await?;
    let (chosen, warning) = match verdict {
        DivergenceVerdict::LeftNewer => (primary, None),
        DivergenceVerdict::RightNewer => (secondary, None),
        DivergenceVerdict::Diverged => {
            warn!(
                primary,
                secondary,
                fallback = canonical,
                "maintainer branches diverged, falling back to canonical ref"
            );
            let warning = SyncWarning::DivergedBranches {
                primary: primary.to_string(),
                secondary: secondary.to_string(),
                fallback: canonical.to_string(),
            };
            (canonical, Some(warning))
        }
    };
    Ok(Selection {
        chosen: chosen.to_string(),
        verdict,
        warning,
    })
}
