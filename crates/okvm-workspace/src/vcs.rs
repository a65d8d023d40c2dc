//! Snapshot backends.
//!
//! [`VersionControl`] is the seam between a [`Workspace`](crate::Workspace)
//! and whatever records its history. The git backend keeps its object
//! database in a directory beside the sandbox tree, never inside it, so no
//! tool call can read or corrupt the history.

use chrono::{DateTime, Utc};
use git2::{build::CheckoutBuilder, IndexAddOption, Oid, Repository, Signature, Sort};
use okvm_core::{OkvmError, OkvmResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

const DEFAULT_LABEL: &str = "Workspace snapshot";
const AUTHOR_NAME: &str = "okvm";
const AUTHOR_EMAIL: &str = "okvm@localhost";

/// Content-addressed snapshot identifier (a commit hash for git).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    /// Wraps an already-validated identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An immutable checkpoint of a workspace tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Content-derived identifier.
    #[serde(rename = "snapshot_id")]
    pub id: SnapshotId,
    /// Normalised human label.
    pub label: String,
    /// Creation time (second resolution for git).
    pub created_at: DateTime<Utc>,
    /// Previous snapshot in the chain; `None` for the first one.
    pub parent: Option<SnapshotId>,
}

/// Trims a label, collapses inner whitespace, and falls back to a default.
pub fn normalize_label(label: Option<&str>) -> String {
    let collapsed = label
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .unwrap_or_default();
    if collapsed.is_empty() {
        DEFAULT_LABEL.to_string()
    } else {
        collapsed
    }
}

/// Records and materialises workspace snapshots.
///
/// Implementations are driven from the blocking pool while the owning
/// workspace's operation gate is held, so they may block freely.
pub trait VersionControl: Send {
    /// Whether this backend actually records snapshots.
    fn enabled(&self) -> bool;

    /// Records the current tree as a new snapshot on top of the chain.
    fn commit(&mut self, label: &str) -> OkvmResult<Snapshot>;

    /// Writes the tree of snapshot `id` into the empty directory `target`.
    ///
    /// Must not alter the chain.
    fn checkout(&mut self, id: &SnapshotId, target: &Path) -> OkvmResult<()>;

    /// Up to `limit` snapshots, newest first.
    fn log(&self, limit: usize) -> OkvmResult<Vec<Snapshot>>;

    /// Maps a caller-supplied identifier onto a snapshot in this log.
    fn resolve(&self, id: &str) -> OkvmResult<SnapshotId>;
}

fn git_err(err: git2::Error) -> OkvmError {
    OkvmError::Workspace(format!("git: {}", err.message()))
}

/// Git-backed snapshots via libgit2.
///
/// The repository is bare on disk and gets its work tree attached in
/// memory, which keeps any `.git` entry out of the sandbox.
pub struct GitVersionControl {
    repo: Repository,
    workdir: PathBuf,
}

impl GitVersionControl {
    /// Opens the repository at `git_dir`, initialising it when missing.
    pub fn open_or_init(git_dir: &Path, workdir: &Path) -> OkvmResult<Self> {
        let repo = if git_dir.join("HEAD").exists() {
            Repository::open_bare(git_dir).map_err(git_err)?
        } else {
            std::fs::create_dir_all(git_dir)?;
            Repository::init_bare(git_dir).map_err(git_err)?
        };
        repo.set_workdir(workdir, false).map_err(git_err)?;
        Ok(Self {
            repo,
            workdir: workdir.to_path_buf(),
        })
    }

    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo.head().ok().and_then(|h| h.peel_to_commit().ok())
    }

    fn to_snapshot(commit: &git2::Commit<'_>) -> Snapshot {
        Snapshot {
            id: SnapshotId::new(commit.id().to_string()),
            label: commit.message().unwrap_or_default().trim_end().to_string(),
            created_at: DateTime::from_timestamp(commit.time().seconds(), 0).unwrap_or_default(),
            parent: commit
                .parent_id(0)
                .ok()
                .map(|oid| SnapshotId::new(oid.to_string())),
        }
    }
}

impl VersionControl for GitVersionControl {
    fn enabled(&self) -> bool {
        true
    }

    fn commit(&mut self, label: &str) -> OkvmResult<Snapshot> {
        let mut index = self.repo.index().map_err(git_err)?;
        // Rebuild from scratch so deletions are picked up and a tool-written
        // .gitignore cannot hide files from the snapshot.
        index.clear().map_err(git_err)?;
        index
            .add_all(["*"].iter(), IndexAddOption::FORCE, None)
            .map_err(git_err)?;
        index.write().map_err(git_err)?;
        let tree_id = index.write_tree().map_err(git_err)?;
        let tree = self.repo.find_tree(tree_id).map_err(git_err)?;

        let sig = Signature::now(AUTHOR_NAME, AUTHOR_EMAIL).map_err(git_err)?;
        let parent = self.head_commit();
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, label, &tree, &parents)
            .map_err(git_err)?;
        let commit = self.repo.find_commit(oid).map_err(git_err)?;
        tracing::debug!(workdir = %self.workdir.display(), snapshot_id = %oid, "Committed snapshot");
        Ok(Self::to_snapshot(&commit))
    }

    fn checkout(&mut self, id: &SnapshotId, target: &Path) -> OkvmResult<()> {
        let oid = Oid::from_str(id.as_str())
            .map_err(|_| OkvmError::UnknownSnapshot(id.to_string()))?;
        let commit = self
            .repo
            .find_commit(oid)
            .map_err(|_| OkvmError::UnknownSnapshot(id.to_string()))?;
        let tree = commit.tree().map_err(git_err)?;

        let mut builder = CheckoutBuilder::new();
        builder
            .target_dir(target)
            .force()
            .recreate_missing(true)
            .update_index(false);
        self.repo
            .checkout_tree(tree.as_object(), Some(&mut builder))
            .map_err(git_err)
    }

    fn log(&self, limit: usize) -> OkvmResult<Vec<Snapshot>> {
        if self.head_commit().is_none() {
            return Ok(Vec::new());
        }
        let mut walk = self.repo.revwalk().map_err(git_err)?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)
            .map_err(git_err)?;
        walk.push_head().map_err(git_err)?;

        let mut out = Vec::new();
        for oid in walk.take(limit) {
            let oid = oid.map_err(git_err)?;
            let commit = self.repo.find_commit(oid).map_err(git_err)?;
            out.push(Self::to_snapshot(&commit));
        }
        Ok(out)
    }

    fn resolve(&self, id: &str) -> OkvmResult<SnapshotId> {
        let id = id.trim();
        let well_formed = (7..=40).contains(&id.len()) && id.chars().all(|c| c.is_ascii_hexdigit());
        if !well_formed {
            return Err(OkvmError::UnknownSnapshot(id.to_string()));
        }
        let commit = self
            .repo
            .revparse_single(id)
            .and_then(|obj| obj.peel_to_commit())
            .map_err(|_| OkvmError::UnknownSnapshot(id.to_string()))?;
        Ok(SnapshotId::new(commit.id().to_string()))
    }
}

/// Backend used when snapshots are turned off.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledVersionControl;

impl VersionControl for DisabledVersionControl {
    fn enabled(&self) -> bool {
        false
    }

    fn commit(&mut self, _label: &str) -> OkvmResult<Snapshot> {
        Err(OkvmError::SnapshotsDisabled)
    }

    fn checkout(&mut self, _id: &SnapshotId, _target: &Path) -> OkvmResult<()> {
        Err(OkvmError::SnapshotsDisabled)
    }

    fn log(&self, _limit: usize) -> OkvmResult<Vec<Snapshot>> {
        Ok(Vec::new())
    }

    fn resolve(&self, _id: &str) -> OkvmResult<SnapshotId> {
        Err(OkvmError::SnapshotsDisabled)
    }
}
