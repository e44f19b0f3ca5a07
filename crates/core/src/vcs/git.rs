//! Git adapter: `git2` for read-only queries, the `git` CLI for mutations.
//!
//! Merges and rebases go through the CLI because the recorded-resolution
//! cache (`rerere`) only exists there. Every CLI call is bounded by the
//! adapter's timeout; an expired call is killed and reported as
//! [`GitError::Timeout`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use git2::{ConfigLevel, ErrorCode, Oid, Repository, RepositoryState};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::{CommitId, ConflictKind, ConflictedPath, MergeOutcome, Vcs};
use crate::errors::GitError;
use crate::models::CommitFilter;

/// Git repository handle driving the `git` binary in `repo_path`.
pub struct GitCli {
    repo: Repository,
    repo_path: PathBuf,
    timeout: Duration,
    /// HEAD and REBASE_HEAD at the last rebase stop.
    rebase_stop: Option<(Option<Oid>, Option<Oid>)>,
}

impl GitCli {
    /// Open an existing repository. Turns on `rerere.enabled` in the
    /// repository config when no level sets it, so resolutions an operator
    /// makes by hand are recorded for later runs.
    pub fn open<P: AsRef<Path>>(repo_path: P, timeout: Duration) -> Result<Self, GitError> {
        let path = repo_path.as_ref();
        info!(path = %path.display(), "opening git repository");
        let repo = Repository::open(path)
            .map_err(|_| GitError::RepositoryNotFound(path.display().to_string()))?;
        let client = Self {
            repo,
            repo_path: path.to_path_buf(),
            timeout,
            rebase_stop: None,
        };
        client.enable_resolution_cache()?;
        Ok(client)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn enable_resolution_cache(&self) -> Result<(), GitError> {
        let config = self.repo.config()?;
        if config.get_bool("rerere.enabled").is_ok() {
            return Ok(());
        }
        let mut local = config.open_level(ConfigLevel::Local)?;
        local.set_bool("rerere.enabled", true)?;
        info!("enabled rerere in repository config");
        Ok(())
    }

    fn peel(&self, reference: &str) -> Result<Option<Oid>, GitError> {
        match self.repo.revparse_single(&format!("{reference}^{{commit}}")) {
            Ok(object) => Ok(Some(object.id())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn require(&self, reference: &str) -> Result<Oid, GitError> {
        self.peel(reference)?
            .ok_or_else(|| GitError::RefNotFound(reference.to_string()))
    }

    /// Unmerged index entries, re-read from disk.
    fn index_conflicts(&self) -> Result<Vec<ConflictedPath>, GitError> {
        let mut index = self.repo.index()?;
        index.read(true)?;
        let mut paths = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let entry = conflict
                .our
                .as_ref()
                .or(conflict.their.as_ref())
                .or(conflict.ancestor.as_ref());
            let Some(entry) = entry else { continue };
            let kind = ConflictKind::from_stages(
                conflict.ancestor.is_some(),
                conflict.our.is_some(),
                conflict.their.is_some(),
            );
            paths.push(ConflictedPath::new(
                String::from_utf8_lossy(&entry.path).into_owned(),
                kind,
            ));
        }
        paths.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(paths)
    }

    fn is_rebasing(&self) -> bool {
        matches!(
            self.repo.state(),
            RepositoryState::Rebase
                | RepositoryState::RebaseInteractive
                | RepositoryState::RebaseMerge
                | RepositoryState::ApplyMailboxOrRebase
        )
    }

    fn rebase_position(&self) -> Result<(Option<Oid>, Option<Oid>), GitError> {
        Ok((self.peel("HEAD")?, self.peel("REBASE_HEAD")?))
    }

    /// Report a stopped rebase. `--rerere-autoupdate` may already have staged
    /// every path, in which case the list is empty and the caller continues.
    /// A stop with nothing unmerged at the same position as the previous one
    /// cannot make progress and is an error.
    fn rebase_stopped(&mut self, args: &[&str], output: &Output) -> Result<MergeOutcome, GitError> {
        let conflicts = self.index_conflicts()?;
        let position = self.rebase_position()?;
        if conflicts.is_empty() && self.rebase_stop == Some(position) {
            return Err(command_failed(args, output));
        }
        info!(count = conflicts.len(), "rebase stopped on conflicts");
        self.rebase_stop = Some(position);
        Ok(MergeOutcome::Conflicted(conflicts))
    }

    async fn exec(&self, args: &[&str]) -> Result<Output, GitError> {
        let command = format!("git {}", args.join(" "));
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.repo_path)
            .args(["-c", "rerere.enabled=true"])
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_EDITOR", "true")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(cmd = %command, "running git command");
        match timeout(self.timeout, cmd.output()).await {
            Ok(output) => Ok(output?),
            Err(_) => {
                let secs = self.timeout.as_secs();
                warn!(cmd = %command, secs, "git command timed out");
                Err(GitError::Timeout { command, secs })
            }
        }
    }

    async fn run_git(&self, args: &[&str]) -> Result<String, GitError> {
        let output = self.exec(args).await?;
        if !output.status.success() {
            return Err(command_failed(args, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn command_failed(args: &[&str], output: &Output) -> GitError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let exit_code = output.status.code().unwrap_or(-1);
    warn!(exit_code, %stderr, "git command failed");
    GitError::CommandFailed {
        command: format!("git {}", args.join(" ")),
        exit_code,
        stderr,
    }
}

/// Fetch failures worth retrying: the remote could not be reached or the
/// connection dropped. Anything else (unknown remote, auth) is permanent.
fn is_network_failure(stderr: &str) -> bool {
    const NETWORK: &[&str] = &[
        "could not resolve host",
        "temporary failure in name resolution",
        "connection timed out",
        "operation timed out",
        "connection refused",
        "connection reset",
        "network is unreachable",
        "no route to host",
        "the remote end hung up unexpectedly",
        "early eof",
    ];
    let stderr = stderr.to_ascii_lowercase();
    NETWORK.iter().any(|needle| stderr.contains(needle))
}

impl Vcs for GitCli {
    #[instrument(skip(self))]
    async fn update_remotes(&mut self) -> Result<(), GitError> {
        info!("updating remotes");
        let args = ["remote", "update", "--prune"];
        let output = self.exec(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_network_failure(&stderr) {
                warn!(%stderr, "remote update failed, network error");
                return Err(GitError::Transient(stderr));
            }
            return Err(command_failed(&args, &output));
        }
        debug!("remote update completed");
        Ok(())
    }

    async fn resolve_commit(&self, reference: &str) -> Result<Option<CommitId>, GitError> {
        Ok(self.peel(reference)?.map(CommitId::from))
    }

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
        let a = self.require(ancestor)?;
        let d = self.require(descendant)?;
        Ok(a == d || self.repo.graph_descendant_of(d, a)?)
    }

    async fn operation_in_progress(&self) -> Result<Option<String>, GitError> {
        let name = match self.repo.state() {
            RepositoryState::Clean => return Ok(None),
            RepositoryState::Merge => "merge",
            RepositoryState::Revert | RepositoryState::RevertSequence => "revert",
            RepositoryState::CherryPick | RepositoryState::CherryPickSequence => "cherry-pick",
            RepositoryState::Bisect => "bisect",
            RepositoryState::ApplyMailbox => "am",
            RepositoryState::Rebase
            | RepositoryState::RebaseInteractive
            | RepositoryState::RebaseMerge
            | RepositoryState::ApplyMailboxOrRebase => "rebase",
        };
        Ok(Some(name.to_string()))
    }

    #[instrument(skip(self))]
    async fn checkout(&mut self, branch: Option<&str>) -> Result<String, GitError> {
        let (current, detached_at) = {
            let head = self.repo.head()?;
            if head.is_branch() {
                (head.shorthand().map(str::to_string), None)
            } else {
                (None, head.target().map(|oid| oid.to_string()))
            }
        };

        let Some(target) = branch else {
            return current.ok_or(GitError::NotOnBranch);
        };
        let previous = current.or(detached_at).ok_or(GitError::NotOnBranch)?;
        self.run_git(&["checkout", "-q", target]).await?;
        debug!(from = %previous, to = target, "checked out branch");
        Ok(previous)
    }

    #[instrument(skip(self))]
    async fn reset_hard(&mut self, reference: &str) -> Result<(), GitError> {
        self.run_git(&["reset", "-q", "--hard", reference]).await?;
        info!(reference, "reset current branch");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn merge_no_ff(&mut self, source: &str) -> Result<MergeOutcome, GitError> {
        let args = ["merge", "--no-ff", "--no-edit", "--rerere-autoupdate", source];
        let output = self.exec(&args).await?;
        if output.status.success() {
            info!(source, "merged cleanly");
            return Ok(MergeOutcome::Clean);
        }
        if self.repo.state() == RepositoryState::Merge {
            let conflicts = self.index_conflicts()?;
            info!(source, count = conflicts.len(), "merge stopped on conflicts");
            return Ok(MergeOutcome::Conflicted(conflicts));
        }
        Err(command_failed(&args, &output))
    }

    async fn remove_path(&mut self, path: &str) -> Result<(), GitError> {
        self.run_git(&["rm", "-q", "-f", "--", path]).await?;
        debug!(path, "removed conflicted path");
        Ok(())
    }

    async fn replay_recorded_resolutions(
        &mut self,
        paths: &[String],
    ) -> Result<Vec<String>, GitError> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        self.run_git(&["rerere"]).await?;
        let unresolved: HashSet<String> = self
            .index_conflicts()?
            .into_iter()
            .map(|c| c.path)
            .collect();
        Ok(paths
            .iter()
            .filter(|p| unresolved.contains(p.as_str()))
            .cloned()
            .collect())
    }

    #[instrument(skip(self))]
    async fn commit_merge(&mut self) -> Result<(), GitError> {
        self.run_git(&["commit", "-q", "--no-edit"]).await?;
        info!("committed merge");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn rebase_onto(
        &mut self,
        new_base: &str,
        branch: &str,
    ) -> Result<MergeOutcome, GitError> {
        let args = ["rebase", "--rerere-autoupdate", new_base, branch];
        self.rebase_stop = None;
        let output = self.exec(&args).await?;
        if output.status.success() {
            info!(new_base, branch, "rebased cleanly");
            return Ok(MergeOutcome::Clean);
        }
        if self.is_rebasing() {
            return self.rebase_stopped(&args, &output);
        }
        Err(command_failed(&args, &output))
    }

    #[instrument(skip(self))]
    async fn continue_rebase(&mut self) -> Result<MergeOutcome, GitError> {
        let args = ["rebase", "--continue"];
        let output = self.exec(&args).await?;
        if output.status.success() {
            self.rebase_stop = None;
            info!("rebase finished");
            return Ok(MergeOutcome::Clean);
        }
        if self.is_rebasing() {
            return self.rebase_stopped(&args, &output);
        }
        Err(command_failed(&args, &output))
    }

    #[instrument(skip(self))]
    async fn tag_force(&mut self, name: &str, target: &str) -> Result<(), GitError> {
        self.run_git(&["tag", "-f", name, target]).await?;
        info!(name, target, "moved tag");
        Ok(())
    }

    #[instrument(skip(self, refspecs))]
    async fn push(&mut self, remote: &str, refspecs: &[String], force: bool) -> Result<(), GitError> {
        info!(remote, count = refspecs.len(), force, "pushing");
        let mut args = vec!["push"];
        if force {
            args.push("--force");
        }
        args.push(remote);
        args.extend(refspecs.iter().map(String::as_str));

        let output = self.exec(&args).await?;
        if output.status.success() {
            info!("push completed");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("[rejected]") {
            warn!(remote, %stderr, "push rejected");
            return Err(GitError::PushRejected {
                remote: remote.to_string(),
                detail: stderr,
            });
        }
        Err(command_failed(&args, &output))
    }

    async fn newest_matching(
        &self,
        reference: &str,
        filter: &CommitFilter,
    ) -> Result<Option<CommitId>, GitError> {
        let mut args: Vec<String> = vec!["log".into(), "-1".into(), "--pretty=format:%H".into()];
        if filter.no_merges {
            args.push("--no-merges".into());
        }
        if let Some(author) = &filter.author {
            args.push(format!("--author={author}"));
        }
        args.push(reference.to_string());
        args.push("--".into());
        if let Some(path) = &filter.path {
            args.push(path.clone());
        }

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.run_git(&args).await?;
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        CommitId::parse(trimmed).map(Some)
    }
}
