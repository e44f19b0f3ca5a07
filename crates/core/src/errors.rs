//! Error types for the branchsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`. Repository
//! failures surface as [`GitError`], configuration problems as
//! [`ConfigError`], and the orchestration layer wraps both in [`SyncError`]
//! together with the conflict halts that require an operator.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from the version-control adapter.
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, tag, SHA) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// Git printed something that is not an object name.
    #[error("not a git object id: {0:?}")]
    InvalidObjectId(String),

    /// HEAD is detached and the caller needed a branch.
    #[error("HEAD is detached; check out a branch before running branchsync")]
    NotOnBranch,

    /// A merge, rebase or similar operation is still pending in the work tree.
    #[error("a git {0} is in progress; finish or abort it, then rerun")]
    OperationInProgress(String),

    /// A `git` command exited with a non-zero status.
    #[error("`{command}` failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// A `git` command did not finish within the configured timeout.
    #[error("`{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    /// Network or remote-side failure that may succeed on a later attempt.
    #[error("transient git failure: {0}")]
    Transient(String),

    /// Push was rejected (e.g. non-fast-forward without force).
    #[error("git push to '{remote}' rejected: {detail}")]
    PushRejected { remote: String, detail: String },

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl GitError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// An integration branch depends on one that is built after it.
    #[error("integration branch '{branch}' depends on '{dependency}', which is not built before it")]
    DependencyOrder { branch: String, dependency: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Sync errors
// ---------------------------------------------------------------------------

/// Errors from the synchronization run.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A merge left conflicts that no recorded resolution covers.
    #[error(
        "merging '{source_ref}' into '{branch}' left unresolved conflicts in: {}. \
         Resolve them, commit the merge, and rerun.",
        paths.join(", ")
    )]
    MergeConflictUnresolved {
        branch: String,
        source_ref: String,
        paths: Vec<String>,
    },

    /// A rebase stopped on conflicts that no recorded resolution covers.
    #[error(
        "rebasing '{branch}' onto '{onto}' stopped on unresolved conflicts in: {}. \
         Resolve them, finish the rebase with `git rebase --continue`, and rerun.",
        paths.join(", ")
    )]
    RebaseConflictUnresolved {
        branch: String,
        onto: String,
        paths: Vec<String>,
    },

    /// A state-machine transition was invalid.
    #[error("invalid sync state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// The branch checked out before the run could not be restored.
    #[error("failed to restore branch '{branch}': {detail}")]
    RestoreFailed { branch: String, detail: String },

    /// Underlying Git error during sync.
    #[error("sync Git error: {0}")]
    Git(#[from] GitError),

    /// Configuration error discovered while planning.
    #[error("sync configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// True for halts that an operator must resolve by hand before rerunning.
    pub fn needs_human(&self) -> bool {
        matches!(
            self,
            Self::MergeConflictUnresolved { .. } | Self::RebaseConflictUnresolved { .. }
        )
    }
}
