use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use git2::{IndexAddOption, Repository, Signature};

use crate::errors::{AttractorError, Result};

/// The narrow slice of version control the document store relies on.
///
/// Real implementation: [`GitVcs`]. Test double: [`MemoryVcs`].
pub trait VersionControl: Send + Sync {
    /// Start tracking `dir`. Fails if it is already tracked.
    fn initialize(&self, dir: &Path) -> Result<()>;

    /// Stage everything and commit. Returns `false` when nothing was staged,
    /// in which case no commit is created.
    fn commit_if_dirty(&self, dir: &Path, message: &str) -> Result<bool>;

    /// `true` iff a remote named `origin` is configured.
    fn has_remote(&self, dir: &Path) -> Result<bool>;

    /// Fast-forward-only pull from `origin`; no-op without a remote.
    fn sync_fast_forward_only(&self, dir: &Path) -> Result<()>;

    /// Push the current branch; no-op without a remote.
    fn push(&self, dir: &Path) -> Result<()>;
}

/// Git adapter: `git2` for local operations, the `git` CLI for network ones
/// so that the user's credential helpers apply.
#[derive(Debug, Clone, Default)]
pub struct GitVcs;

impl GitVcs {
    pub fn new() -> Self {
        Self
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        match repo.signature() {
            Ok(sig) => Ok(sig.to_owned()),
            Err(_) => Ok(Signature::now("attractor", "attractor@localhost")?),
        }
    }

    fn run_git(dir: &Path, operation: &str, args: &[&str]) -> Result<()> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| AttractorError::io(dir, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AttractorError::SyncFailure {
                operation: operation.to_string(),
                detail: stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

impl VersionControl for GitVcs {
    fn initialize(&self, dir: &Path) -> Result<()> {
        if dir.join(".git").exists() {
            return Err(AttractorError::Conflict(format!(
                "{} is already a git repository",
                dir.display()
            )));
        }
        std::fs::create_dir_all(dir).map_err(|e| AttractorError::io(dir, e))?;
        Repository::init(dir)?;
        Ok(())
    }

    fn commit_if_dirty(&self, dir: &Path, message: &str) -> Result<bool> {
        let repo = Repository::open(dir)?;
        let mut index = repo.index()?;

        // add_all picks up new and modified files, update_all drops deleted ones
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());

        let unchanged = match &parent {
            Some(commit) => commit.tree_id() == tree_id,
            None => index.is_empty(),
        };
        if unchanged {
            return Ok(false);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        tracing::debug!(dir = %dir.display(), message, "committed store changes");
        Ok(true)
    }

    fn has_remote(&self, dir: &Path) -> Result<bool> {
        let repo = Repository::open(dir)?;
        Ok(repo.find_remote("origin").is_ok())
    }

    fn sync_fast_forward_only(&self, dir: &Path) -> Result<()> {
        if !self.has_remote(dir)? {
            return Ok(());
        }
        tracing::debug!(dir = %dir.display(), "pulling store (fast-forward only)");
        Self::run_git(dir, "pull --ff-only", &["pull", "--ff-only"])
    }

    fn push(&self, dir: &Path) -> Result<()> {
        if !self.has_remote(dir)? {
            return Ok(());
        }
        tracing::debug!(dir = %dir.display(), "pushing store");
        Self::run_git(dir, "push", &["push"])
    }
}

/// Calls recorded by [`MemoryVcs`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VcsLog {
    pub initialized: Vec<PathBuf>,
    pub commits: Vec<String>,
    pub syncs: usize,
    pub pushes: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    log: VcsLog,
    remote: bool,
    fail_sync: bool,
    fail_push: bool,
    /// Fingerprint of the tree at the last commit.
    committed: Option<Vec<(PathBuf, Vec<u8>)>>,
}

/// In-memory stand-in for git.
///
/// Dirtiness is decided by fingerprinting the working tree (paths and
/// contents) against the fingerprint captured at the previous commit.
#[derive(Debug, Default)]
pub struct MemoryVcs {
    state: Mutex<MemoryState>,
}

impl MemoryVcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend an `origin` remote is configured.
    pub fn with_remote(self) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.remote = true;
        }
        self
    }

    pub fn fail_sync(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_sync = fail;
        }
    }

    pub fn fail_push(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_push = fail;
        }
    }

    pub fn log(&self) -> VcsLog {
        self.state
            .lock()
            .map(|state| state.log.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| AttractorError::LockPoisoned)
    }

    fn fingerprint(dir: &Path) -> Result<Vec<(PathBuf, Vec<u8>)>> {
        let mut files = Vec::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let entries = std::fs::read_dir(&current).map_err(|e| AttractorError::io(&current, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| AttractorError::io(&current, e))?;
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    let bytes = std::fs::read(&path).map_err(|e| AttractorError::io(&path, e))?;
                    let relative = path.strip_prefix(dir).unwrap_or(&path).to_path_buf();
                    files.push((relative, bytes));
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

impl VersionControl for MemoryVcs {
    fn initialize(&self, dir: &Path) -> Result<()> {
        let mut state = self.lock()?;
        if state.log.initialized.iter().any(|p| p == dir) {
            return Err(AttractorError::Conflict(format!(
                "{} is already initialized",
                dir.display()
            )));
        }
        std::fs::create_dir_all(dir).map_err(|e| AttractorError::io(dir, e))?;
        state.log.initialized.push(dir.to_path_buf());
        Ok(())
    }

    fn commit_if_dirty(&self, dir: &Path, message: &str) -> Result<bool> {
        let snapshot = Self::fingerprint(dir)?;
        let mut state = self.lock()?;
        let dirty = match &state.committed {
            Some(previous) => previous != &snapshot,
            None => !snapshot.is_empty(),
        };
        if !dirty {
            return Ok(false);
        }
        state.committed = Some(snapshot);
        state.log.commits.push(message.to_string());
        Ok(true)
    }

    fn has_remote(&self, _dir: &Path) -> Result<bool> {
        Ok(self.lock()?.remote)
    }

    fn sync_fast_forward_only(&self, _dir: &Path) -> Result<()> {
        let mut state = self.lock()?;
        if !state.remote {
            return Ok(());
        }
        if state.fail_sync {
            return Err(AttractorError::SyncFailure {
                operation: "pull --ff-only".to_string(),
                detail: "fatal: Not possible to fast-forward, aborting.".to_string(),
            });
        }
        state.log.syncs += 1;
        Ok(())
    }

    fn push(&self, _dir: &Path) -> Result<()> {
        let mut state = self.lock()?;
        if !state.remote {
            return Ok(());
        }
        if state.fail_push {
            return Err(AttractorError::SyncFailure {
                operation: "push".to_string(),
                detail: "! [rejected] main -> main (fetch first)".to_string(),
            });
        }
        state.log.pushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn commit_count(dir: &Path) -> usize {
        let repo = Repository::open(dir).unwrap();
        let mut walk = repo.revwalk().unwrap();
        if walk.push_head().is_err() {
            return 0;
        }
        walk.count()
    }

    #[test]
    fn test_git_initialize_twice_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let vcs = GitVcs::new();
        vcs.initialize(&path).unwrap();
        assert!(path.join(".git").is_dir());
        let err = vcs.initialize(&path).unwrap_err();
        assert!(matches!(err, AttractorError::Conflict(_)));
    }

    #[test]
    fn test_git_commit_if_dirty_never_creates_empty_commit() {
        let dir = tempdir().unwrap();
        let vcs = GitVcs::new();
        vcs.initialize(dir.path()).unwrap();

        // Nothing staged in a fresh repo
        assert!(!vcs.commit_if_dirty(dir.path(), "empty").unwrap());
        assert_eq!(commit_count(dir.path()), 0);

        fs::write(dir.path().join("a.json"), "{}\n").unwrap();
        assert!(vcs.commit_if_dirty(dir.path(), "first").unwrap());
        assert!(!vcs.commit_if_dirty(dir.path(), "second").unwrap());
        assert_eq!(commit_count(dir.path()), 1);
    }

    #[test]
    fn test_git_commit_stages_deletions() {
        let dir = tempdir().unwrap();
        let vcs = GitVcs::new();
        vcs.initialize(dir.path()).unwrap();
        fs::write(dir.path().join("a.json"), "{}\n").unwrap();
        fs::write(dir.path().join("b.json"), "{}\n").unwrap();
        vcs.commit_if_dirty(dir.path(), "add").unwrap();

        fs::remove_file(dir.path().join("b.json")).unwrap();
        assert!(vcs.commit_if_dirty(dir.path(), "delete").unwrap());

        let repo = Repository::open(dir.path()).unwrap();
        let tree = repo.head().unwrap().peel_to_tree().unwrap();
        assert!(tree.get_name("a.json").is_some());
        assert!(tree.get_name("b.json").is_none());
    }

    #[test]
    fn test_git_without_remote_sync_and_push_are_noops() {
        let dir = tempdir().unwrap();
        let vcs = GitVcs::new();
        vcs.initialize(dir.path()).unwrap();
        assert!(!vcs.has_remote(dir.path()).unwrap());
        vcs.sync_fast_forward_only(dir.path()).unwrap();
        vcs.push(dir.path()).unwrap();
    }

    #[test]
    fn test_git_has_remote_detects_origin() {
        let dir = tempdir().unwrap();
        let vcs = GitVcs::new();
        vcs.initialize(dir.path()).unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        repo.remote("origin", "https://example.invalid/store.git").unwrap();
        assert!(vcs.has_remote(dir.path()).unwrap());
    }

    #[test]
    fn test_memory_vcs_commits_only_on_change() {
        let dir = tempdir().unwrap();
        let vcs = MemoryVcs::new();
        vcs.initialize(dir.path()).unwrap();
        fs::write(dir.path().join("meta.json"), "{}").unwrap();

        assert!(vcs.commit_if_dirty(dir.path(), "one").unwrap());
        assert!(!vcs.commit_if_dirty(dir.path(), "two").unwrap());
        fs::write(dir.path().join("meta.json"), "{\"x\":1}").unwrap();
        assert!(vcs.commit_if_dirty(dir.path(), "three").unwrap());

        assert_eq!(vcs.log().commits, vec!["one", "three"]);
    }

    #[test]
    fn test_memory_vcs_simulated_failures() {
        let dir = tempdir().unwrap();
        let vcs = MemoryVcs::new().with_remote();
        vcs.sync_fast_forward_only(dir.path()).unwrap();
        vcs.fail_sync(true);
        vcs.fail_push(true);
        assert!(matches!(
            vcs.sync_fast_forward_only(dir.path()),
            Err(AttractorError::SyncFailure { .. })
        ));
        assert!(matches!(
            vcs.push(dir.path()),
            Err(AttractorError::SyncFailure { .. })
        ));
        assert_eq!(vcs.log().syncs, 1);
        assert_eq!(vcs.log().pushes, 0);
    }
}
