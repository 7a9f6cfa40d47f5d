//! Git-backed JSON document store.
//!
//! ## Layout
//!
//! ```text
//! <store>/
//!   .attractor-store.json       { store_id }
//!   meta.json                   { next_issue_id, next_comment_id }
//!   labels.json                 [ Label, ... ]
//!   issues/<number>.json        Issue
//!   comments/<issue>/<id>.json  Comment
//! ```
//!
//! Every entity lives in its own file. Writes are visible to readers as soon
//! as the file is written; `commit` is the only consistency boundary and
//! there is no document-level locking. The identifier counters are the one
//! exception: allocation holds an exclusive lock on `meta.json` for the whole
//! read-increment-write sequence.

pub mod query;
pub mod vcs;

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::{AttractorError, Result};
use crate::models::{Comment, Issue, IssueFilters, Label, ListResponse, Meta, StoreManifest};

pub use vcs::{GitVcs, MemoryVcs, VersionControl};

pub const MANIFEST_FILE: &str = ".attractor-store.json";
pub const META_FILE: &str = "meta.json";
pub const LABELS_FILE: &str = "labels.json";
pub const ISSUES_DIR: &str = "issues";
pub const COMMENTS_DIR: &str = "comments";

/// Typed CRUD over one store directory.
pub struct ProjectStore {
    root: PathBuf,
    vcs: Arc<dyn VersionControl>,
}

impl std::fmt::Debug for ProjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ProjectStore {
    /// Attach to an existing store directory without checks.
    pub fn open(root: impl Into<PathBuf>, vcs: Arc<dyn VersionControl>) -> Self {
        Self {
            root: root.into(),
            vcs,
        }
    }

    /// Attach to a store, refusing it if its manifest belongs to another
    /// project.
    pub fn open_verified(
        root: impl Into<PathBuf>,
        expected_store_id: &str,
        vcs: Arc<dyn VersionControl>,
    ) -> Result<Self> {
        let store = Self::open(root, vcs);
        let manifest = store.read_manifest()?.ok_or_else(|| {
            AttractorError::NotFound(format!(
                "Store manifest not found at {}",
                store.root.display()
            ))
        })?;
        if manifest.store_id != expected_store_id {
            return Err(AttractorError::StoreIdMismatch {
                expected: expected_store_id.to_string(),
                actual: manifest.store_id,
            });
        }
        Ok(store)
    }

    /// Create and scaffold a new store, then record the initial commit.
    pub fn init(
        root: impl Into<PathBuf>,
        store_id: &str,
        vcs: Arc<dyn VersionControl>,
    ) -> Result<Self> {
        let store = Self::open(root, vcs);
        store.vcs.initialize(&store.root)?;
        for dir in [store.issues_dir(), store.comments_dir()] {
            fs::create_dir_all(&dir).map_err(|e| AttractorError::io(&dir, e))?;
        }
        store.write_meta(&Meta::default())?;
        store.write_labels(&[])?;
        store.write_manifest(store_id)?;
        store.commit("Initialize project")?;
        tracing::info!(root = %store.root.display(), store_id, "initialized store");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.join(".git").is_dir()
    }

    fn issues_dir(&self) -> PathBuf {
        self.root.join(ISSUES_DIR)
    }

    fn comments_dir(&self) -> PathBuf {
        self.root.join(COMMENTS_DIR)
    }

    fn issue_path(&self, number: i64) -> PathBuf {
        self.issues_dir().join(format!("{}.json", number))
    }

    fn comment_dir(&self, issue_number: i64) -> PathBuf {
        self.comments_dir().join(issue_number.to_string())
    }

    fn comment_path(&self, issue_number: i64, comment_id: i64) -> PathBuf {
        self.comment_dir(issue_number)
            .join(format!("{}.json", comment_id))
    }

    // ── Manifest ─────────────────────────────────────────────────────

    pub fn read_manifest(&self) -> Result<Option<StoreManifest>> {
        read_json(&self.root.join(MANIFEST_FILE))
    }

    pub fn write_manifest(&self, store_id: &str) -> Result<()> {
        write_json(
            &self.root.join(MANIFEST_FILE),
            &StoreManifest {
                store_id: store_id.to_string(),
            },
        )
    }

    // ── Meta / counters ──────────────────────────────────────────────

    pub fn read_meta(&self) -> Result<Meta> {
        Ok(read_json(&self.root.join(META_FILE))?.unwrap_or_default())
    }

    pub fn write_meta(&self, meta: &Meta) -> Result<()> {
        write_json(&self.root.join(META_FILE), meta)
    }

    /// Allocate the next issue number.
    pub fn next_issue_id(&self) -> Result<i64> {
        self.allocate(|meta| &mut meta.next_issue_id)
    }

    /// Allocate the next comment id (store-wide, not per issue).
    pub fn next_comment_id(&self) -> Result<i64> {
        self.allocate(|meta| &mut meta.next_comment_id)
    }

    /// Read-increment-write on one counter under an exclusive lock on
    /// `meta.json`. Returns the value before the increment.
    ///
    /// Defaults apply only when this call creates `meta.json`. An existing
    /// file that is empty or unparsable is an error, never a counter reset.
    fn allocate(&self, counter: fn(&mut Meta) -> &mut i64) -> Result<i64> {
        let path = self.root.join(META_FILE);
        let existed = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| AttractorError::io(&path, e))?;
        file.lock_exclusive()
            .map_err(|e| AttractorError::io(&path, e))?;

        let result = bump_counter(&mut file, &path, existed, counter);

        if let Err(e) = FileExt::unlock(&file) {
            tracing::warn!(path = %path.display(), error = %e, "failed to release counter lock");
        }
        result
    }

    // ── Issues ───────────────────────────────────────────────────────

    pub fn read_issue(&self, number: i64) -> Result<Option<Issue>> {
        read_json(&self.issue_path(number))
    }

    pub fn write_issue(&self, issue: &Issue) -> Result<()> {
        write_json(&self.issue_path(issue.number), issue)
    }

    pub fn list_issues(&self, filters: &IssueFilters) -> Result<ListResponse<Issue>> {
        let issues = read_json_dir(&self.issues_dir())?;
        Ok(query::apply_filters(issues, filters))
    }

    /// Remove an issue and every comment attached to it.
    pub fn delete_issue(&self, number: i64) -> Result<()> {
        remove_file_if_exists(&self.issue_path(number))?;
        let comments = self.comment_dir(number);
        match fs::remove_dir_all(&comments) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AttractorError::io(&comments, e)),
        }
    }

    // ── Comments ─────────────────────────────────────────────────────

    pub fn read_comment(&self, issue_number: i64, comment_id: i64) -> Result<Option<Comment>> {
        read_json(&self.comment_path(issue_number, comment_id))
    }

    pub fn write_comment(&self, issue_number: i64, comment: &Comment) -> Result<()> {
        write_json(&self.comment_path(issue_number, comment.id), comment)
    }

    /// Comments of one issue, oldest first.
    pub fn list_comments(
        &self,
        issue_number: i64,
        page: usize,
        per_page: usize,
    ) -> Result<ListResponse<Comment>> {
        let mut comments: Vec<Comment> = read_json_dir(&self.comment_dir(issue_number))?;
        comments.sort_by_key(|c| c.created_at);
        Ok(query::paginate(comments, page, per_page))
    }

    /// Locate a comment by id without knowing its issue. Scans every
    /// issue's comment directory.
    pub fn find_comment(&self, comment_id: i64) -> Result<Option<(i64, Comment)>> {
        let dir = self.comments_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AttractorError::io(&dir, e)),
        };

        for entry in entries {
            let entry = entry.map_err(|e| AttractorError::io(&dir, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(issue_number) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i64>().ok())
            else {
                continue;
            };
            if let Some(comment) = self.read_comment(issue_number, comment_id)? {
                return Ok(Some((issue_number, comment)));
            }
        }
        Ok(None)
    }

    pub fn delete_comment(&self, issue_number: i64, comment_id: i64) -> Result<()> {
        remove_file_if_exists(&self.comment_path(issue_number, comment_id))
    }

    // ── Labels ───────────────────────────────────────────────────────

    /// The whole label collection. Name uniqueness and cascading renames
    /// onto issues are the caller's job.
    pub fn read_labels(&self) -> Result<Vec<Label>> {
        Ok(read_json(&self.root.join(LABELS_FILE))?.unwrap_or_default())
    }

    pub fn write_labels(&self, labels: &[Label]) -> Result<()> {
        write_json(&self.root.join(LABELS_FILE), &labels)
    }

    // ── Version control ──────────────────────────────────────────────

    /// Stage and commit everything; never records an empty commit.
    pub fn commit(&self, message: &str) -> Result<bool> {
        self.vcs.commit_if_dirty(&self.root, message)
    }

    pub fn sync(&self) -> Result<()> {
        self.vcs.sync_fast_forward_only(&self.root)
    }

    pub fn push(&self) -> Result<()> {
        self.vcs.push(&self.root)
    }
}

/// Async-safe handle to a [`ProjectStore`].
///
/// Runs every closure on tokio's blocking pool via `spawn_blocking`, so git
/// commands and file I/O never tie up async worker threads.
#[derive(Clone, Debug)]
pub struct StoreHandle {
    inner: Arc<ProjectStore>,
}

impl StoreHandle {
    pub fn new(store: ProjectStore) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    /// Synchronous access for startup code and tests.
    pub fn store(&self) -> &ProjectStore {
        &self.inner
    }

    /// Run a closure with access to the store on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ProjectStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| AttractorError::Other(anyhow::anyhow!("store task panicked: {}", e)))?
    }
}

// ── JSON file helpers ────────────────────────────────────────────────

fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    let mut json = serde_json::to_string_pretty(value)?;
    json.push('\n');
    Ok(json)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(AttractorError::io(path, e)),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| AttractorError::json(path, e))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AttractorError::io(parent, e))?;
    }
    let json = to_pretty_json(value).map_err(|e| AttractorError::json(path, e))?;
    fs::write(path, json).map_err(|e| AttractorError::io(path, e))
}

/// Every `*.json` document directly under `dir`; a missing directory is empty.
fn read_json_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AttractorError::io(dir, e)),
    };

    let mut docs = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| AttractorError::io(dir, e))?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        if let Some(doc) = read_json(&path)? {
            docs.push(doc);
        }
    }
    Ok(docs)
}

fn bump_counter(
    file: &mut std::fs::File,
    path: &Path,
    existed: bool,
    counter: fn(&mut Meta) -> &mut i64,
) -> Result<i64> {
    let mut raw = String::new();
    file.read_to_string(&mut raw)
        .map_err(|e| AttractorError::io(path, e))?;
    let mut meta: Meta = if !existed && raw.is_empty() {
        Meta::default()
    } else {
        serde_json::from_str(&raw).map_err(|e| AttractorError::json(path, e))?
    };

    let slot = counter(&mut meta);
    let current = *slot;
    *slot = current + 1;

    let json = to_pretty_json(&meta).map_err(|e| AttractorError::json(path, e))?;
    // Overwrite in place, then trim; the file is never left empty
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.write_all(json.as_bytes()))
        .and_then(|_| file.set_len(json.len() as u64))
        .and_then(|_| file.sync_data())
        .map_err(|e| AttractorError::io(path, e))?;
    Ok(current)
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AttractorError::io(path, e)),
    }
}
