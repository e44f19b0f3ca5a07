//! TOML-based configuration for branchsync.
//!
//! The file describes the repository and every branch relationship the tool
//! maintains. It is parsed with [`AppConfig::load_from_file`], checked with
//! [`AppConfig::validate`], and turned into a [`SyncPlan`] before anything
//! touches the repository.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::models::{
    BranchSpec, ForwardSpec, MirrorSpec, PushTarget, SyncPlan, TagSpec, Tier, TopLevelSpec,
};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Repository and process settings.
    pub repository: RepositoryConfig,

    /// Branches reset 1:1 to an upstream ref.
    #[serde(default, rename = "mirror")]
    pub mirrors: Vec<MirrorSpec>,

    /// Tags force-moved to their target.
    #[serde(default, rename = "tag")]
    pub tags: Vec<TagSpec>,

    /// Branches rebased onto the newest of two maintainer branches.
    #[serde(default, rename = "forward")]
    pub forwards: Vec<ForwardSpec>,

    /// Top-level branches checked against their published equivalents.
    #[serde(default)]
    pub top_level: Vec<TopLevelSpec>,

    /// Testing-tier integration branches, built first.
    #[serde(default)]
    pub testing: Vec<BranchSpec>,

    /// Queue-tier integration branches, built after the testing tier.
    #[serde(default)]
    pub queue: Vec<BranchSpec>,

    /// Remotes and refspecs pushed by `branchsync publish`.
    #[serde(default)]
    pub publish: Vec<PushTarget>,
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Working clone the tool operates on. A leading `~/` is expanded.
    pub path: PathBuf,

    /// Upper bound for any single git command (default 600).
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Attempts for a remote update before giving up (default 3).
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: u32,

    /// Seconds to wait between remote update attempts (default 5).
    #[serde(default = "default_fetch_backoff")]
    pub fetch_backoff_secs: u64,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_command_timeout() -> u64 {
    600
}
fn default_fetch_attempts() -> u32 {
    3
}
fn default_fetch_backoff() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".into()
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Commented starting point written by `branchsync init`.
pub const TEMPLATE: &str = r#"# branchsync configuration

[repository]
path = "~/src/kernel"
# command_timeout_secs = 600
# fetch_attempts = 3
# fetch_backoff_secs = 5
# log_level = "info"

# Branches reset to an upstream ref whenever they fall behind.
[[mirror]]
branch = "master"
upstream = "origin/master"

# Follow the newest matching commit instead of the upstream tip:
# [mirror.filter]
# author = "Linus Torvalds"
# path = "Makefile"

# [[tag]]
# name = "latest-rc"
# target = "master"

# Rebased onto whichever maintainer branch is newer, or onto the
# canonical ref when the two have diverged.
# [[forward]]
# branch = "for-next"
# primary = "maintainer-a/for-next"
# secondary = "maintainer-b/for-next"
# canonical = "origin/for-next"

# Integration branches are rebuilt only when one of these is stale.
# [[top_level]]
# branch = "for-next"
# upstream = "origin/for-next"

# [[testing]]
# branch = "testing/for-next"
# baseline = "master"
# sources = ["for-next"]

# [[queue]]
# branch = "queue/for-next"
# baseline = "testing/for-next"
# sources = ["review/pending"]

# [[publish]]
# remote = "origin"
# refspecs = ["testing/for-next", "queue/for-next"]
# force = true
"#;

impl AppConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns `ConfigError::FileNotFound` if the path does not exist.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config = Self::parse(&contents)?;

        debug!(
            mirrors = config.mirrors.len(),
            forwards = config.forwards.len(),
            integration = config.testing.len() + config.queue.len(),
            "configuration parsed successfully"
        );
        Ok(config)
    }

    /// Parse configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut config: AppConfig =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        for spec in &mut config.testing {
            spec.tier = Tier::Testing;
        }
        for spec in &mut config.queue {
            spec.tier = Tier::Queue;
        }
        Ok(config)
    }

    /// Convenience: load and validate in one step.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Default config location, `<config dir>/branchsync/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("branchsync").join("config.toml"))
    }

    /// Repository path with a leading `~/` expanded.
    pub fn repo_path(&self) -> PathBuf {
        expand_tilde(&self.repository.path)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.repository.command_timeout_secs)
    }

    pub fn fetch_backoff(&self) -> Duration {
        Duration::from_secs(self.repository.fetch_backoff_secs)
    }

    /// Integration branches in build order: testing tier, then queue tier.
    pub fn integration(&self) -> impl Iterator<Item = &BranchSpec> {
        self.testing.iter().chain(self.queue.iter())
    }

    /// The validated plan the engine executes.
    pub fn sync_plan(&self) -> Result<SyncPlan, ConfigError> {
        self.validate()?;
        Ok(SyncPlan {
            mirrors: self.mirrors.clone(),
            tags: self.tags.clone(),
            forwards: self.forwards.clone(),
            top_level: self.top_level.clone(),
            integration: self.integration().cloned().collect(),
            publish: self.publish.clone(),
        })
    }

    /// Validate the configuration, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let repo = &self.repository;
        if repo.path.as_os_str().is_empty() {
            return Err(invalid("repository.path", "repository path must not be empty"));
        }
        if repo.command_timeout_secs == 0 {
            return Err(invalid(
                "repository.command_timeout_secs",
                "command timeout must be > 0",
            ));
        }
        if repo.fetch_attempts == 0 {
            return Err(invalid(
                "repository.fetch_attempts",
                "at least one fetch attempt is required",
            ));
        }
        if !LOG_LEVELS.contains(&repo.log_level.as_str()) {
            return Err(invalid(
                "repository.log_level",
                &format!("expected one of {}", LOG_LEVELS.join(", ")),
            ));
        }

        for m in &self.mirrors {
            check_ref("mirror.branch", &m.branch)?;
            check_ref("mirror.upstream", &m.upstream)?;
        }
        for t in &self.tags {
            check_ref("tag.name", &t.name)?;
            check_ref("tag.target", &t.target)?;
        }
        for f in &self.forwards {
            check_ref("forward.branch", &f.branch)?;
            check_ref("forward.primary", &f.primary)?;
            check_ref("forward.secondary", &f.secondary)?;
            check_ref("forward.canonical", &f.canonical)?;
        }
        for t in &self.top_level {
            check_ref("top_level.branch", &t.branch)?;
            check_ref("top_level.upstream", &t.upstream)?;
        }
        for p in &self.publish {
            if p.remote.trim().is_empty() {
                return Err(invalid("publish.remote", "remote must not be empty"));
            }
            if p.refspecs.is_empty() {
                return Err(invalid(
                    &format!("publish.{}.refspecs", p.remote),
                    "at least one refspec is required",
                ));
            }
        }

        self.validate_integration()?;
        self.validate_unique_targets()
    }

    fn validate_integration(&self) -> Result<(), ConfigError> {
        let integration: HashSet<&str> = self.integration().map(|s| s.name.as_str()).collect();
        if !integration.is_empty() && self.top_level.is_empty() {
            return Err(invalid(
                "top_level",
                "integration branches need at least one [[top_level]] entry to decide when to rebuild",
            ));
        }

        let mut built: HashSet<&str> = HashSet::new();
        for spec in self.integration() {
            let field = format!("{}.{}", spec.tier, spec.name);
            check_ref(&format!("{field}.branch"), &spec.name)?;
            check_ref(&format!("{field}.baseline"), &spec.baseline)?;
            if spec.sources.is_empty() {
                return Err(invalid(
                    &format!("{field}.sources"),
                    "at least one source is required",
                ));
            }
            for dep in spec.dependencies() {
                check_ref(&format!("{field}.sources"), dep)?;
                let out_of_order = integration.contains(dep) && !built.contains(dep);
                if dep == spec.name || out_of_order {
                    return Err(ConfigError::DependencyOrder {
                        branch: spec.name.clone(),
                        dependency: dep.to_string(),
                    });
                }
            }
            built.insert(spec.name.as_str());
        }
        Ok(())
    }

    fn validate_unique_targets(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        let targets = self
            .mirrors
            .iter()
            .map(|m| m.branch.as_str())
            .chain(self.forwards.iter().map(|f| f.branch.as_str()))
            .chain(self.integration().map(|s| s.name.as_str()));
        for target in targets {
            if !seen.insert(target) {
                return Err(invalid(
                    target,
                    "branch is maintained by more than one entry",
                ));
            }
        }
        Ok(())
    }
}

fn invalid(field: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        detail: detail.to_string(),
    }
}

fn check_ref(field: &str, name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(invalid(field, "ref name must not be empty"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(invalid(field, &format!("ref name '{name}' contains whitespace")));
    }
    if name.contains("..") {
        return Err(invalid(field, &format!("ref name '{name}' contains '..'")));
    }
    Ok(())
}

/// Expand a leading `~/` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
