//! branchsync core library.
//!
//! This crate keeps a set of interdependent maintainer branches synchronized
//! with their upstreams: configuration, the version-control adapter, ancestry
//! and freshness checks, conflict replay, integration rebuilds, forward-branch
//! reconciliation, publishing, and the sync engine that drives them.

pub mod ancestry;
pub mod config;
pub mod conflict;
pub mod errors;
pub mod forward;
pub mod freshness;
pub mod models;
pub mod plan;
pub mod publish;
pub mod sync_engine;
pub mod vcs;

// Re-exports for convenience.
pub use config::AppConfig;
pub use errors::{ConfigError, GitError, SyncError};
pub use models::{BranchStatus, SyncPlan, SyncReport, SyncWarning};
pub use sync_engine::{EngineSettings, SyncEngine, SyncState};
pub use vcs::{GitCli, Vcs};
