//! Multi-branch synchronization engine.
//!
//! The [`SyncEngine`] drives one run through a fixed state machine:
//!
//! 1. Refresh every remote, retrying transient failures a bounded number of
//!    times.
//! 2. Reset stale mirrors to their upstream and move stale tags.
//! 3. Check the top-level branches against their published equivalents and
//!    plan the forward branches. If nothing is stale the run ends here.
//! 4. Rebase forward branches, then rebuild the testing and queue tiers in
//!    dependency order.
//!
//! The branch checked out when the run started is checked out again on every
//! exit path, except when a merge or rebase is left pending for the operator.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::{ConfigError, GitError, SyncError};
use crate::forward::{self, ForwardPlan};
use crate::freshness::is_up_to_date;
use crate::models::{
    BranchRole, BranchStatus, MirrorSpec, SyncPlan, SyncReport, SyncWarning,
};
use crate::plan;
use crate::publish;
use crate::vcs::{CommitId, GitCli, Vcs};

// ---------------------------------------------------------------------------
// Sync state machine
// ---------------------------------------------------------------------------

/// States of a synchronization run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    FetchingRemotes,
    UpdatingLeafBranches,
    CheckingTopLevel,
    RebuildingIntegration,
    Done,
    Halted,
}

impl SyncState {
    /// Whether the run may move from `self` to `next`.
    pub fn can_transition_to(self, next: SyncState) -> bool {
        use SyncState::*;
        matches!(
            (self, next),
            (Idle, FetchingRemotes)
                | (FetchingRemotes, UpdatingLeafBranches)
                | (UpdatingLeafBranches, CheckingTopLevel)
                | (CheckingTopLevel, RebuildingIntegration)
                | (CheckingTopLevel, Done)
                | (RebuildingIntegration, Done)
                | (Done, Idle)
                | (Halted, Idle)
        ) || (next == Halted && !self.is_terminal())
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Halted)
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::FetchingRemotes => write!(f, "fetching_remotes"),
            Self::UpdatingLeafBranches => write!(f, "updating_leaf_branches"),
            Self::CheckingTopLevel => write!(f, "checking_top_level"),
            Self::RebuildingIntegration => write!(f, "rebuilding_integration"),
            Self::Done => write!(f, "done"),
            Self::Halted => write!(f, "halted"),
        }
    }
}

/// Knobs the engine takes from `[repository]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub fetch_attempts: u32,
    pub fetch_backoff: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            fetch_attempts: config.repository.fetch_attempts,
            fetch_backoff: config.fetch_backoff(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            fetch_attempts: 3,
            fetch_backoff: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The synchronization engine. It owns the repository adapter; nothing else
/// holds a handle to the working tree while it runs.
pub struct SyncEngine<V: Vcs> {
    vcs: V,
    plan: SyncPlan,
    settings: EngineSettings,
    state: SyncState,
}

impl SyncEngine<GitCli> {
    /// Open the configured repository and build an engine for it.
    pub fn from_config(config: &AppConfig) -> Result<Self, SyncError> {
        let vcs = GitCli::open(config.repo_path(), config.command_timeout())?;
        Ok(Self::new(vcs, config)?)
    }
}

impl<V: Vcs> SyncEngine<V> {
    /// Create an engine for `vcs` from a configuration, validating it first.
    pub fn new(vcs: V, config: &AppConfig) -> Result<Self, ConfigError> {
        let plan = config.sync_plan()?;
        Ok(Self::from_parts(vcs, plan, EngineSettings::from_config(config)))
    }

    pub fn from_parts(vcs: V, plan: SyncPlan, settings: EngineSettings) -> Self {
        info!(
            mirrors = plan.mirrors.len(),
            forwards = plan.forwards.len(),
            integration = plan.integration.len(),
            "initializing sync engine"
        );
        Self {
            vcs,
            plan,
            settings,
            state: SyncState::Idle,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn plan(&self) -> &SyncPlan {
        &self.plan
    }

    pub fn vcs(&self) -> &V {
        &self.vcs
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Execute one full synchronization run.
    ///
    /// Conflicts covered by recorded resolutions are settled inline. Anything
    /// else halts the run with a needs-human [`SyncError`] and leaves the
    /// merge or rebase pending so the operator can finish it and rerun.
    pub async fn synchronize(&mut self) -> Result<SyncReport, SyncError> {
        if self.state.is_terminal() {
            self.transition(SyncState::Idle)?;
        }

        let restore_point = match self.preflight().await {
            Ok(branch) => branch,
            Err(e) => {
                self.halt(&e);
                return Err(e);
            }
        };
        info!(restore_point = %restore_point, "starting synchronization");

        let mut report = SyncReport::new(&restore_point);
        let result = self.run(&mut report).await;
        if let Err(e) = &result {
            self.halt(e);
        }

        let restored = self.restore(&restore_point, &mut report).await;
        report.completed_at = Some(Utc::now());

        match (result, restored) {
            (Err(e), Err(restore_err)) => {
                warn!(error = %restore_err, "restore after failed run also failed");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Err(restore_err)) => Err(restore_err),
            (Ok(()), Ok(())) => {
                info!(
                    refreshed = report.refreshed.len(),
                    forwarded = report.forwarded.len(),
                    rebuilt = report.rebuilt.len(),
                    warnings = report.warnings.len(),
                    "synchronization completed"
                );
                Ok(report)
            }
        }
    }

    /// Read-only status of every mirror, tag, forward and top-level branch.
    /// Uses the remote-tracking refs as they are; nothing is fetched.
    pub async fn status(&self) -> Result<Vec<BranchStatus>, SyncError> {
        let mut rows = Vec::new();

        for m in &self.plan.mirrors {
            let row = match mirror_reference(&self.vcs, m).await? {
                Some(reference) => BranchStatus {
                    name: m.branch.clone(),
                    role: BranchRole::Mirror,
                    reference: m.upstream.clone(),
                    up_to_date: is_up_to_date(&self.vcs, &m.branch, &reference).await?,
                    note: m.filter.as_ref().map(|_| format!("filtered: {reference}")),
                },
                None => BranchStatus {
                    name: m.branch.clone(),
                    role: BranchRole::Mirror,
                    reference: m.upstream.clone(),
                    up_to_date: false,
                    note: Some("no commit matches the filter".into()),
                },
            };
            rows.push(row);
        }

        for t in &self.plan.tags {
            rows.push(BranchStatus {
                name: t.name.clone(),
                role: BranchRole::Tag,
                reference: t.target.clone(),
                up_to_date: is_up_to_date(&self.vcs, &t.name, &t.target).await?,
                note: None,
            });
        }

        for f in &self.plan.forwards {
            let planned = forward::plan(&self.vcs, f).await?;
            rows.push(BranchStatus {
                name: f.branch.clone(),
                role: BranchRole::Forward,
                reference: planned.selection.chosen.clone(),
                up_to_date: !planned.needs_rebase,
                note: planned.selection.warning.as_ref().map(ToString::to_string),
            });
        }

        for t in &self.plan.top_level {
            rows.push(BranchStatus {
                name: t.branch.clone(),
                role: BranchRole::TopLevel,
                reference: t.upstream.clone(),
                up_to_date: is_up_to_date(&self.vcs, &t.branch, &t.upstream).await?,
                note: None,
            });
        }

        Ok(rows)
    }

    /// Refresh remotes, then push every configured target.
    pub async fn publish(&mut self) -> Result<Vec<String>, SyncError> {
        if let Some(op) = self.vcs.operation_in_progress().await? {
            return Err(GitError::OperationInProgress(op).into());
        }
        self.update_remotes().await?;
        Ok(publish::publish(&mut self.vcs, &self.plan.publish).await?)
    }

    // -----------------------------------------------------------------------
    // Run phases
    // -----------------------------------------------------------------------

    /// Refuse to start over a pending operation; return the branch to restore.
    async fn preflight(&mut self) -> Result<String, SyncError> {
        if let Some(op) = self.vcs.operation_in_progress().await? {
            return Err(GitError::OperationInProgress(op).into());
        }
        Ok(self.vcs.checkout(None).await?)
    }

    async fn run(&mut self, report: &mut SyncReport) -> Result<(), SyncError> {
        let before = self.snapshot_top_level().await?;

        self.transition(SyncState::FetchingRemotes)?;
        self.update_remotes().await?;

        self.transition(SyncState::UpdatingLeafBranches)?;
        self.update_mirrors(report).await?;
        self.update_tags(report).await?;

        self.transition(SyncState::CheckingTopLevel)?;
        let stale = self.stale_top_level().await?;
        let forwards = self.plan_forwards(report).await?;
        let pending: Vec<&ForwardPlan> = forwards.iter().filter(|p| p.needs_rebase).collect();

        if stale.is_empty() && pending.is_empty() {
            info!("top-level branches are up to date, nothing to rebuild");
            report.rebuild_skipped = true;
        } else {
            self.transition(SyncState::RebuildingIntegration)?;
            for planned in pending {
                if forward::apply(&mut self.vcs, planned).await? {
                    report.forwarded.push(planned.branch.clone());
                }
            }
            for spec in &self.plan.integration {
                if plan::is_current(&self.vcs, spec).await? {
                    debug!(branch = %spec.name, "integration branch already current");
                    continue;
                }
                plan::rebuild(&mut self.vcs, spec).await?;
                report.rebuilt.push(spec.name.clone());
            }
        }

        report.changed = self.changed_since(&before).await?;
        self.transition(SyncState::Done)
    }

    /// Update remotes, retrying transient failures. Timeouts are not retried.
    async fn update_remotes(&mut self) -> Result<(), SyncError> {
        let attempts = self.settings.fetch_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.vcs.update_remotes().await {
                Ok(()) => {
                    debug!(attempt, "remotes updated");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(attempt, attempts, error = %e, "remote update failed, retrying");
                    tokio::time::sleep(self.settings.fetch_backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn update_mirrors(&mut self, report: &mut SyncReport) -> Result<(), SyncError> {
        for m in &self.plan.mirrors {
            let reference = mirror_reference(&self.vcs, m).await?.ok_or_else(|| {
                GitError::RefNotFound(format!("{} (no commit matches the mirror filter)", m.upstream))
            })?;
            if is_up_to_date(&self.vcs, &m.branch, &reference).await? {
                debug!(branch = %m.branch, "mirror up to date");
                continue;
            }
            self.vcs.checkout(Some(&m.branch)).await?;
            self.vcs.reset_hard(&reference).await?;
            info!(branch = %m.branch, upstream = %m.upstream, "mirror refreshed");
            report.refreshed.push(m.branch.clone());
        }
        Ok(())
    }

    async fn update_tags(&mut self, report: &mut SyncReport) -> Result<(), SyncError> {
        for t in &self.plan.tags {
            if is_up_to_date(&self.vcs, &t.name, &t.target).await? {
                continue;
            }
            self.vcs.tag_force(&t.name, &t.target).await?;
            info!(tag = %t.name, target = %t.target, "tag moved");
            report.tags_moved.push(t.name.clone());
        }
        Ok(())
    }

    async fn stale_top_level(&self) -> Result<Vec<String>, SyncError> {
        let mut stale = Vec::new();
        for t in &self.plan.top_level {
            if !is_up_to_date(&self.vcs, &t.branch, &t.upstream).await? {
                info!(branch = %t.branch, upstream = %t.upstream, "top-level branch differs from upstream");
                stale.push(t.branch.clone());
            }
        }
        Ok(stale)
    }

    async fn plan_forwards(&self, report: &mut SyncReport) -> Result<Vec<ForwardPlan>, SyncError> {
        let mut plans = Vec::with_capacity(self.plan.forwards.len());
        for spec in &self.plan.forwards {
            let planned = forward::plan(&self.vcs, spec).await?;
            if let Some(warning) = &planned.selection.warning {
                report.warnings.push(warning.clone());
            }
            plans.push(planned);
        }
        Ok(plans)
    }

    async fn snapshot_top_level(&self) -> Result<HashMap<String, Option<CommitId>>, SyncError> {
        let mut snapshot = HashMap::new();
        for t in &self.plan.top_level {
            snapshot.insert(t.branch.clone(), self.vcs.resolve_commit(&t.branch).await?);
        }
        Ok(snapshot)
    }

    async fn changed_since(
        &self,
        before: &HashMap<String, Option<CommitId>>,
    ) -> Result<Vec<String>, SyncError> {
        let mut changed = Vec::new();
        for t in &self.plan.top_level {
            let now = self.vcs.resolve_commit(&t.branch).await?;
            if before.get(&t.branch) != Some(&now) {
                changed.push(t.branch.clone());
            }
        }
        Ok(changed)
    }

    // -----------------------------------------------------------------------
    // State handling
    // -----------------------------------------------------------------------

    fn transition(&mut self, next: SyncState) -> Result<(), SyncError> {
        if !self.state.can_transition_to(next) {
            return Err(SyncError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!(from = %self.state, to = %next, "sync state transition");
        self.state = next;
        Ok(())
    }

    fn halt(&mut self, error: &SyncError) {
        warn!(state = %self.state, needs_human = error.needs_human(), error = %error, "synchronization halted");
        self.state = SyncState::Halted;
    }

    /// Check the restore point out again. A pending merge or rebase is left
    /// alone so the operator finds the repository at the conflict.
    async fn restore(&mut self, branch: &str, report: &mut SyncReport) -> Result<(), SyncError> {
        if let Some(op) = self.vcs.operation_in_progress().await? {
            let warning = SyncWarning::RestoreSkipped {
                branch: branch.to_string(),
                reason: format!("a {op} is in progress"),
            };
            warn!("{warning}");
            report.warnings.push(warning);
            return Ok(());
        }
        match self.vcs.checkout(Some(branch)).await {
            Ok(_) => {
                debug!(branch, "restored original branch");
                report.restored = true;
                Ok(())
            }
            Err(e) => Err(SyncError::RestoreFailed {
                branch: branch.to_string(),
                detail: e.to_string(),
            }),
        }
    }
}

/// The commit or ref a mirror should point at, `None` when a filter matches
/// nothing on the upstream.
async fn mirror_reference<V: Vcs>(vcs: &V, m: &MirrorSpec) -> Result<Option<String>, GitError> {
    match &m.filter {
        None => Ok(Some(m.upstream.clone())),
        Some(filter) => Ok(vcs
            .newest_matching(&m.upstream, filter)
            .await?
            .map(|id| id.to_string())),
    }
}
