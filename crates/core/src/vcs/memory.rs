//! In-memory repository used by the engine tests.
//!
//! Commits carry whole-file snapshots so merges and rebases run a real
//! three-way comparison per path. Recorded resolutions are keyed by
//! (path, ours, theirs) content, which is what a conflict signature
//! identifies.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use super::{CommitId, ConflictKind, ConflictedPath, MergeOutcome, Vcs};
use crate::errors::GitError;
use crate::models::CommitFilter;

pub(crate) type Files = BTreeMap<String, String>;

#[derive(Debug, Clone)]
struct MemCommit {
    parents: Vec<CommitId>,
    files: Files,
    author: String,
}

#[derive(Debug, Clone)]
enum Head {
    Branch(String),
    Detached(CommitId),
}

#[derive(Debug, Clone)]
struct PathConflict {
    kind: ConflictKind,
    ours: Option<String>,
    theirs: Option<String>,
}

type Conflicts = BTreeMap<String, PathConflict>;

#[derive(Debug, Clone)]
enum Pending {
    Merge {
        branch: String,
        ours: CommitId,
        source: String,
        theirs: CommitId,
        files: Files,
        conflicts: Conflicts,
    },
    Rebase {
        branch: String,
        onto: CommitId,
        author: String,
        remaining: VecDeque<CommitId>,
        files: Files,
        conflicts: Conflicts,
    },
}

type ResolutionKey = (String, Option<String>, Option<String>);

pub(crate) struct MemoryVcs {
    commits: HashMap<CommitId, MemCommit>,
    branches: BTreeMap<String, CommitId>,
    refs: BTreeMap<String, CommitId>,
    head: Head,
    pending: Option<Pending>,
    resolutions: HashMap<ResolutionKey, Option<String>>,
    fetched_refs: Vec<(String, CommitId)>,
    next_id: u64,
    root: CommitId,
    /// One line per mutation, e.g. `merge rdma-next into testing/rdma-next`.
    pub journal: Vec<String>,
    pub transient_fetch_failures: u32,
    pub fetches: u32,
    pub pushes: Vec<(String, Vec<String>, bool)>,
}

impl MemoryVcs {
    /// A repository with one empty root commit on `main`, which is checked out.
    pub fn new() -> Self {
        let mut vcs = Self {
            commits: HashMap::new(),
            branches: BTreeMap::new(),
            refs: BTreeMap::new(),
            head: Head::Branch("main".into()),
            pending: None,
            resolutions: HashMap::new(),
            fetched_refs: Vec::new(),
            next_id: 1,
            root: CommitId(String::new()),
            journal: Vec::new(),
            transient_fetch_failures: 0,
            fetches: 0,
            pushes: Vec::new(),
        };
        let root = vcs.add_commit(Vec::new(), Files::new(), "root");
        vcs.branches.insert("main".into(), root.clone());
        vcs.root = root;
        vcs
    }

    pub fn root(&self) -> CommitId {
        self.root.clone()
    }

    /// New commit on top of `parent` with `changes` applied (`None` deletes).
    pub fn commit(&mut self, parent: &CommitId, changes: &[(&str, Option<&str>)]) -> CommitId {
        self.commit_by("dev", parent, changes)
    }

    pub fn commit_by(
        &mut self,
        author: &str,
        parent: &CommitId,
        changes: &[(&str, Option<&str>)],
    ) -> CommitId {
        let mut files = self.commits[parent].files.clone();
        apply_changes(&mut files, changes);
        self.add_commit(vec![parent.clone()], files, author)
    }

    /// Merge commit with the first parent's files plus `changes`.
    pub fn merge_of(&mut self, parents: &[&CommitId], changes: &[(&str, Option<&str>)]) -> CommitId {
        let mut files = self.commits[parents[0]].files.clone();
        apply_changes(&mut files, changes);
        let parents = parents.iter().map(|p| (*p).clone()).collect();
        self.add_commit(parents, files, "dev")
    }

    pub fn set_branch(&mut self, name: &str, id: &CommitId) {
        self.branches.insert(name.to_string(), id.clone());
    }

    /// Set a read-only ref such as `origin/master`.
    pub fn set_ref(&mut self, name: &str, id: &CommitId) {
        self.refs.insert(name.to_string(), id.clone());
    }

    /// Make `name` point at `id` on the next successful remote update.
    pub fn on_fetch(&mut self, name: &str, id: &CommitId) {
        self.fetched_refs.push((name.to_string(), id.clone()));
    }

    pub fn switch_to(&mut self, branch: &str) {
        self.head = Head::Branch(branch.to_string());
    }

    pub fn detach(&mut self, id: &CommitId) {
        self.head = Head::Detached(id.clone());
    }

    pub fn record_resolution(
        &mut self,
        path: &str,
        ours: Option<&str>,
        theirs: Option<&str>,
        resolved: Option<&str>,
    ) {
        self.resolutions.insert(
            (
                path.to_string(),
                ours.map(str::to_string),
                theirs.map(str::to_string),
            ),
            resolved.map(str::to_string),
        );
    }

    pub fn tip(&self, name: &str) -> CommitId {
        self.lookup(name)
            .unwrap_or_else(|| panic!("unknown ref {name}"))
    }

    pub fn files_at(&self, name: &str) -> Files {
        self.commits[&self.tip(name)].files.clone()
    }

    pub fn parents_of(&self, name: &str) -> Vec<CommitId> {
        self.commits[&self.tip(name)].parents.clone()
    }

    pub fn current_branch(&self) -> Option<String> {
        match &self.head {
            Head::Branch(b) => Some(b.clone()),
            Head::Detached(_) => None,
        }
    }

    /// Number of journal lines starting with `op`.
    pub fn count(&self, op: &str) -> usize {
        self.journal
            .iter()
            .filter(|line| line.split_whitespace().next() == Some(op))
            .count()
    }

    // -- internals ----------------------------------------------------------

    fn add_commit(&mut self, parents: Vec<CommitId>, files: Files, author: &str) -> CommitId {
        let id = CommitId::parse(&format!("{:040x}", self.next_id)).unwrap();
        self.next_id += 1;
        self.commits.insert(
            id.clone(),
            MemCommit {
                parents,
                files,
                author: author.to_string(),
            },
        );
        id
    }

    fn head_commit(&self) -> Option<CommitId> {
        match &self.head {
            Head::Branch(b) => self.branches.get(b).cloned(),
            Head::Detached(id) => Some(id.clone()),
        }
    }

    fn lookup(&self, name: &str) -> Option<CommitId> {
        if name == "HEAD" {
            return self.head_commit();
        }
        if let Some(id) = self.branches.get(name).or_else(|| self.refs.get(name)) {
            return Some(id.clone());
        }
        CommitId::parse(name)
            .ok()
            .filter(|id| self.commits.contains_key(id))
    }

    fn require(&self, name: &str) -> Result<CommitId, GitError> {
        self.lookup(name)
            .ok_or_else(|| GitError::RefNotFound(name.to_string()))
    }

    fn ancestors(&self, id: &CommitId) -> HashSet<CommitId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id.clone()]);
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.commits[&next].parents.iter().cloned());
            }
        }
        seen
    }

    fn generation(&self, id: &CommitId) -> usize {
        self.commits[id]
            .parents
            .iter()
            .map(|p| self.generation(p) + 1)
            .max()
            .unwrap_or(0)
    }

    fn merge_base(&self, a: &CommitId, b: &CommitId) -> Option<CommitId> {
        let left = self.ancestors(a);
        self.ancestors(b)
            .into_iter()
            .filter(|id| left.contains(id))
            .max_by_key(|id| self.generation(id))
    }

    fn ensure_idle(&self) -> Result<(), GitError> {
        match &self.pending {
            Some(Pending::Merge { .. }) => Err(GitError::OperationInProgress("merge".into())),
            Some(Pending::Rebase { .. }) => Err(GitError::OperationInProgress("rebase".into())),
            None => Ok(()),
        }
    }

    fn pending_parts(&mut self) -> Result<(&mut Files, &mut Conflicts), GitError> {
        match self.pending.as_mut() {
            Some(Pending::Merge {
                files, conflicts, ..
            })
            | Some(Pending::Rebase {
                files, conflicts, ..
            }) => Ok((files, conflicts)),
            None => Err(GitError::CommandFailed {
                command: "conflict resolution".into(),
                exit_code: 128,
                stderr: "no operation in progress".into(),
            }),
        }
    }

    fn autoupdate(&self, files: &mut Files, conflicts: &mut Conflicts) {
        conflicts.retain(|path, c| {
            let key = (path.clone(), c.ours.clone(), c.theirs.clone());
            match self.resolutions.get(&key) {
                Some(Some(content)) => {
                    files.insert(path.clone(), content.clone());
                    false
                }
                Some(None) => {
                    files.remove(path);
                    false
                }
                None => true,
            }
        });
    }

    fn run_picks(
        &mut self,
        branch: String,
        mut current: CommitId,
        mut remaining: VecDeque<CommitId>,
    ) -> MergeOutcome {
        while let Some(next) = remaining.pop_front() {
            let commit = self.commits[&next].clone();
            let base = self.commits[&commit.parents[0]].files.clone();
            let ours = self.commits[&current].files.clone();
            let (mut files, mut conflicts) = three_way(&base, &ours, &commit.files);
            if conflicts.is_empty() {
                current = self.add_commit(vec![current], files, &commit.author);
                continue;
            }
            // Like `--rerere-autoupdate`: recorded resolutions are staged, but
            // the pick still stops.
            self.autoupdate(&mut files, &mut conflicts);
            let listed = listed(&conflicts);
            self.head = Head::Detached(current.clone());
            self.pending = Some(Pending::Rebase {
                branch,
                onto: current,
                author: commit.author,
                remaining,
                files,
                conflicts,
            });
            return MergeOutcome::Conflicted(listed);
        }
        self.journal.push(format!("rebase {branch}"));
        self.branches.insert(branch.clone(), current);
        self.head = Head::Branch(branch);
        MergeOutcome::Clean
    }
}

fn apply_changes(files: &mut Files, changes: &[(&str, Option<&str>)]) {
    for (path, content) in changes {
        match content {
            Some(c) => files.insert(path.to_string(), c.to_string()),
            None => files.remove(*path),
        };
    }
}

fn listed(conflicts: &Conflicts) -> Vec<ConflictedPath> {
    conflicts
        .iter()
        .map(|(path, c)| ConflictedPath::new(path.clone(), c.kind))
        .collect()
}

fn three_way(base: &Files, ours: &Files, theirs: &Files) -> (Files, Conflicts) {
    let paths: BTreeSet<&String> = base.keys().chain(ours.keys()).chain(theirs.keys()).collect();
    let mut merged = Files::new();
    let mut conflicts = Conflicts::new();
    for path in paths {
        let (b, o, t) = (base.get(path), ours.get(path), theirs.get(path));
        let result = if o == t {
            o
        } else if o == b {
            t
        } else if t == b {
            o
        } else {
            conflicts.insert(
                path.clone(),
                PathConflict {
                    kind: ConflictKind::from_stages(b.is_some(), o.is_some(), t.is_some()),
                    ours: o.cloned(),
                    theirs: t.cloned(),
                },
            );
            o.or(t)
        };
        if let Some(content) = result {
            merged.insert(path.clone(), content.clone());
        }
    }
    (merged, conflicts)
}

fn unmerged() -> GitError {
    GitError::CommandFailed {
        command: "git commit".into(),
        exit_code: 128,
        stderr: "you have unmerged paths".into(),
    }
}

impl Vcs for MemoryVcs {
    async fn update_remotes(&mut self) -> Result<(), GitError> {
        self.fetches += 1;
        if self.transient_fetch_failures > 0 {
            self.transient_fetch_failures -= 1;
            return Err(GitError::Transient("connection reset by peer".into()));
        }
        for (name, id) in std::mem::take(&mut self.fetched_refs) {
            self.refs.insert(name, id);
        }
        Ok(())
    }

    async fn resolve_commit(&self, reference: &str) -> Result<Option<CommitId>, GitError> {
        Ok(self.lookup(reference))
    }

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
        let a = self.require(ancestor)?;
        let d = self.require(descendant)?;
        Ok(self.ancestors(&d).contains(&a))
    }

    async fn operation_in_progress(&self) -> Result<Option<String>, GitError> {
        Ok(match &self.pending {
            Some(Pending::Merge { .. }) => Some("merge".into()),
            Some(Pending::Rebase { .. }) => Some("rebase".into()),
            None => None,
        })
    }

    async fn checkout(&mut self, branch: Option<&str>) -> Result<String, GitError> {
        let Some(target) = branch else {
            return self.current_branch().ok_or(GitError::NotOnBranch);
        };
        self.ensure_idle()?;
        if !self.branches.contains_key(target) {
            return Err(GitError::RefNotFound(target.to_string()));
        }
        let previous = match &self.head {
            Head::Branch(b) => b.clone(),
            Head::Detached(id) => id.to_string(),
        };
        self.head = Head::Branch(target.to_string());
        self.journal.push(format!("checkout {target}"));
        Ok(previous)
    }

    async fn reset_hard(&mut self, reference: &str) -> Result<(), GitError> {
        let id = self.require(reference)?;
        let Head::Branch(branch) = self.head.clone() else {
            return Err(GitError::NotOnBranch);
        };
        self.pending = None;
        self.branches.insert(branch.clone(), id);
        self.journal.push(format!("reset {branch} {reference}"));
        Ok(())
    }

    async fn merge_no_ff(&mut self, source: &str) -> Result<MergeOutcome, GitError> {
        self.ensure_idle()?;
        let Head::Branch(branch) = self.head.clone() else {
            return Err(GitError::NotOnBranch);
        };
        let ours = self.branches[&branch].clone();
        let theirs = self.require(source)?;
        if self.ancestors(&ours).contains(&theirs) {
            return Ok(MergeOutcome::Clean);
        }
        let base = self
            .merge_base(&ours, &theirs)
            .map(|id| self.commits[&id].files.clone())
            .unwrap_or_default();
        let (files, conflicts) = three_way(
            &base,
            &self.commits[&ours].files,
            &self.commits[&theirs].files,
        );
        if conflicts.is_empty() {
            let merge = self.add_commit(vec![ours, theirs], files, "branchsync");
            self.branches.insert(branch.clone(), merge);
            self.journal.push(format!("merge {source} into {branch}"));
            return Ok(MergeOutcome::Clean);
        }
        let listed = listed(&conflicts);
        self.pending = Some(Pending::Merge {
            branch,
            ours,
            source: source.to_string(),
            theirs,
            files,
            conflicts,
        });
        Ok(MergeOutcome::Conflicted(listed))
    }

    async fn remove_path(&mut self, path: &str) -> Result<(), GitError> {
        let (files, conflicts) = self.pending_parts()?;
        conflicts.remove(path);
        files.remove(path);
        self.journal.push(format!("rm {path}"));
        Ok(())
    }

    async fn replay_recorded_resolutions(
        &mut self,
        paths: &[String],
    ) -> Result<Vec<String>, GitError> {
        let resolutions = self.resolutions.clone();
        let (files, conflicts) = self.pending_parts()?;
        let mut still = Vec::new();
        for path in paths {
            let Some(conflict) = conflicts.get(path) else {
                continue;
            };
            let key = (path.clone(), conflict.ours.clone(), conflict.theirs.clone());
            match resolutions.get(&key) {
                Some(Some(content)) => {
                    files.insert(path.clone(), content.clone());
                    conflicts.remove(path);
                }
                Some(None) => {
                    files.remove(path);
                    conflicts.remove(path);
                }
                None => still.push(path.clone()),
            }
        }
        Ok(still)
    }

    async fn commit_merge(&mut self) -> Result<(), GitError> {
        let Some(Pending::Merge {
            branch,
            ours,
            source,
            theirs,
            files,
            conflicts,
        }) = self.pending.take()
        else {
            return Err(GitError::CommandFailed {
                command: "git commit".into(),
                exit_code: 128,
                stderr: "no merge in progress".into(),
            });
        };
        if !conflicts.is_empty() {
            self.pending = Some(Pending::Merge {
                branch,
                ours,
                source,
                theirs,
                files,
                conflicts,
            });
            return Err(unmerged());
        }
        let merge = self.add_commit(vec![ours, theirs], files, "branchsync");
        self.branches.insert(branch.clone(), merge);
        self.journal.push(format!("merge {source} into {branch}"));
        Ok(())
    }

    async fn rebase_onto(
        &mut self,
        new_base: &str,
        branch: &str,
    ) -> Result<MergeOutcome, GitError> {
        self.ensure_idle()?;
        let base = self.require(new_base)?;
        let tip = self
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| GitError::RefNotFound(branch.to_string()))?;
        let upstream = self.ancestors(&base);
        let mut unique: Vec<CommitId> = self
            .ancestors(&tip)
            .into_iter()
            .filter(|id| !upstream.contains(id) && self.commits[id].parents.len() == 1)
            .collect();
        unique.sort_by_key(|id| self.generation(id));
        Ok(self.run_picks(branch.to_string(), base, unique.into()))
    }

    async fn continue_rebase(&mut self) -> Result<MergeOutcome, GitError> {
        let Some(Pending::Rebase {
            branch,
            onto,
            author,
            remaining,
            files,
            conflicts,
        }) = self.pending.take()
        else {
            return Err(GitError::CommandFailed {
                command: "git rebase --continue".into(),
                exit_code: 128,
                stderr: "no rebase in progress".into(),
            });
        };
        if !conflicts.is_empty() {
            let listed = listed(&conflicts);
            self.pending = Some(Pending::Rebase {
                branch,
                onto,
                author,
                remaining,
                files,
                conflicts,
            });
            return Ok(MergeOutcome::Conflicted(listed));
        }
        let picked = self.add_commit(vec![onto], files, &author);
        Ok(self.run_picks(branch, picked, remaining))
    }

    async fn tag_force(&mut self, name: &str, target: &str) -> Result<(), GitError> {
        let id = self.require(target)?;
        self.refs.insert(name.to_string(), id);
        self.journal.push(format!("tag {name} {target}"));
        Ok(())
    }

    async fn push(&mut self, remote: &str, refspecs: &[String], force: bool) -> Result<(), GitError> {
        self.pushes
            .push((remote.to_string(), refspecs.to_vec(), force));
        self.journal.push(format!("push {remote}"));
        Ok(())
    }

    async fn newest_matching(
        &self,
        reference: &str,
        filter: &CommitFilter,
    ) -> Result<Option<CommitId>, GitError> {
        let mut cursor = Some(self.require(reference)?);
        while let Some(id) = cursor {
            let commit = &self.commits[&id];
            let parent_files = commit.parents.first().map(|p| &self.commits[p].files);
            let is_merge = commit.parents.len() > 1;
            let author_ok = filter
                .author
                .as_ref()
                .map_or(true, |a| commit.author.contains(a.as_str()));
            let path_ok = filter.path.as_ref().map_or(true, |p| {
                commit.files.get(p) != parent_files.and_then(|f| f.get(p))
            });
            if !(filter.no_merges && is_merge) && author_ok && path_ok {
                return Ok(Some(id));
            }
            cursor = commit.parents.first().cloned();
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_three_way_merge_without_conflict() {
        let mut vcs = MemoryVcs::new();
        let root = vcs.root();
        let base = vcs.commit(&root, &[("a", Some("1")), ("b", Some("1"))]);
        let left = vcs.commit(&base, &[("a", Some("2"))]);
        let right = vcs.commit(&base, &[("b", Some("2"))]);
        vcs.set_branch("main", &left);
        vcs.set_branch("topic", &right);

        assert_eq!(vcs.merge_no_ff("topic").await.unwrap(), MergeOutcome::Clean);
        let files = vcs.files_at("main");
        assert_eq!(files["a"], "2");
        assert_eq!(files["b"], "2");
        assert_eq!(vcs.parents_of("main"), vec![left, right]);
    }

    #[tokio::test]
    async fn test_conflict_kinds_and_cache_replay() {
        let mut vcs = MemoryVcs::new();
        let root = vcs.root();
        let base = vcs.commit(&root, &[("a", Some("1")), ("gone", Some("1"))]);
        let ours = vcs.commit(&base, &[("a", Some("ours")), ("gone", None)]);
        let theirs = vcs.commit(&base, &[("a", Some("theirs")), ("gone", Some("2"))]);
        vcs.set_branch("main", &ours);
        vcs.set_branch("topic", &theirs);
        vcs.record_resolution("a", Some("ours"), Some("theirs"), Some("both"));

        let MergeOutcome::Conflicted(paths) = vcs.merge_no_ff("topic").await.unwrap() else {
            panic!("expected conflicts");
        };
        assert_eq!(
            paths,
            vec![
                ConflictedPath::new("a", ConflictKind::BothModified),
                ConflictedPath::new("gone", ConflictKind::DeletedByUs),
            ]
        );
        let still = vcs
            .replay_recorded_resolutions(&["a".to_string(), "gone".to_string()])
            .await
            .unwrap();
        assert_eq!(still, vec!["gone".to_string()]);
        assert!(vcs.commit_merge().await.is_err());
        vcs.remove_path("gone").await.unwrap();
        vcs.commit_merge().await.unwrap();
        assert_eq!(vcs.files_at("main")["a"], "both");
        assert!(!vcs.files_at("main").contains_key("gone"));
    }

    #[tokio::test]
    async fn test_newest_matching_follows_first_parent() {
        let mut vcs = MemoryVcs::new();
        let root = vcs.root();
        let release = vcs.commit_by("Linus", &root, &[("Makefile", Some("rc1"))]);
        let other = vcs.commit_by("Linus", &release, &[("README", Some("x"))]);
        let tip = vcs.commit_by("someone", &other, &[("Makefile", Some("rc2-wip"))]);
        vcs.set_ref("linus/master", &tip);

        let filter = CommitFilter {
            author: Some("Linus".into()),
            path: Some("Makefile".into()),
            no_merges: true,
        };
        assert_eq!(
            vcs.newest_matching("linus/master", &filter).await.unwrap(),
            Some(release)
        );
    }
}
