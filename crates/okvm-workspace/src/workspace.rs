use crate::sandbox;
use crate::vcs::{normalize_label, Snapshot, VersionControl};
use okvm_core::{OkvmError, OkvmResult};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How [`Workspace::write_file`] treats existing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace the file.
    Overwrite,
    /// Add the bytes after the current content.
    Append,
}

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    /// Root-relative path with `/` separators.
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
}

/// Outcome of a successful write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteReceipt {
    pub path: String,
    pub bytes_written: u64,
    pub size: u64,
    pub created: bool,
}

/// Point-in-time view of a workspace for the client-facing layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceState {
    pub workspace_id: String,
    pub root: PathBuf,
    pub used_bytes: u64,
    pub quota_bytes: u64,
    pub snapshots_enabled: bool,
    pub snapshots: Vec<Snapshot>,
}

/// Filesystem facts shared between the async handle and the blocking pool.
struct Layout {
    id: String,
    dir: PathBuf,
    root: PathBuf,
    staging: PathBuf,
    quota: u64,
    usage: AtomicU64,
    destroyed: AtomicBool,
}

impl Layout {
    fn ensure_live(&self) -> OkvmResult<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(OkvmError::Workspace(format!(
                "workspace {} has been destroyed",
                self.id
            )));
        }
        Ok(())
    }

    fn usage(&self) -> u64 {
        self.usage.load(Ordering::Acquire)
    }

    fn set_usage(&self, value: u64) {
        self.usage.store(value, Ordering::Release);
    }
}

const RUNNING: u8 = 0;
const COMMITTED: u8 = 1;
const ABANDONED: u8 = 2;

/// One operation's view of the layout.
///
/// A mutating operation calls [`Op::commit_point`] right before its first
/// visible change. Past that point the caller waits for the real outcome
/// even if its timeout fires; before it, a timed-out operation stops
/// without touching the tree.
struct Op<'a> {
    layout: &'a Layout,
    name: &'static str,
    state: &'a AtomicU8,
}

impl Deref for Op<'_> {
    type Target = Layout;

    fn deref(&self) -> &Layout {
        self.layout
    }
}

impl Op<'_> {
    fn commit_point(&self) -> OkvmResult<()> {
        match self
            .state
            .compare_exchange(RUNNING, COMMITTED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) | Err(COMMITTED) => Ok(()),
            Err(_) => {
                tracing::debug!(workspace_id = %self.layout.id, op = self.name, "Abandoned before commit");
                Err(OkvmError::Timeout(format!(
                    "workspace {} abandoned before it took effect",
                    self.name
                )))
            }
        }
    }
}

/// A sandboxed, quota-bounded directory tree with a snapshot log.
///
/// Every operation is serialised on a per-workspace gate and executed on
/// the blocking pool under the configured timeout. The gate guard moves
/// into the blocking closure, so an operation whose caller gave up still
/// finishes before the next one starts. Different workspaces never share
/// a gate.
pub struct Workspace {
    layout: Arc<Layout>,
    gate: Arc<Mutex<Box<dyn VersionControl>>>,
    snapshots_enabled: bool,
    timeout: Duration,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("id", &self.layout.id)
            .field("root", &self.layout.root)
            .field("quota", &self.layout.quota)
            .field("usage", &self.layout.usage())
            .finish()
    }
}

impl Workspace {
    /// Wraps an allocated `<dir>/{tree,staging}` layout.
    pub(crate) fn new(
        id: String,
        dir: PathBuf,
        root: PathBuf,
        staging: PathBuf,
        quota: u64,
        vcs: Box<dyn VersionControl>,
        timeout: Duration,
    ) -> OkvmResult<Self> {
        let usage = tree_usage(&root)?;
        let snapshots_enabled = vcs.enabled();
        Ok(Self {
            layout: Arc::new(Layout {
                id,
                dir,
                root,
                staging,
                quota,
                usage: AtomicU64::new(usage),
                destroyed: AtomicBool::new(false),
            }),
            gate: Arc::new(Mutex::new(vcs)),
            snapshots_enabled,
            timeout,
        })
    }

    pub fn id(&self) -> &str {
        &self.layout.id
    }

    /// The sandbox root every tool path resolves against.
    pub fn root(&self) -> &Path {
        &self.layout.root
    }

    pub fn quota(&self) -> u64 {
        self.layout.quota
    }

    /// Bytes currently used by regular files under the root.
    pub fn usage(&self) -> u64 {
        self.layout.usage()
    }

    pub fn snapshots_enabled(&self) -> bool {
        self.snapshots_enabled
    }

    pub fn is_destroyed(&self) -> bool {
        self.layout.destroyed.load(Ordering::Acquire)
    }

    async fn run<T, F>(&self, op: &'static str, f: F) -> OkvmResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Op<'_>, &mut dyn VersionControl) -> OkvmResult<T> + Send + 'static,
    {
        let gate = Arc::clone(&self.gate);
        let layout = Arc::clone(&self.layout);
        let state = Arc::new(AtomicU8::new(RUNNING));
        let job_state = Arc::clone(&state);
        let work = async move {
            let mut guard = gate.lock_owned().await;
            tokio::task::spawn_blocking(move || {
                layout.ensure_live()?;
                if job_state.load(Ordering::Acquire) == ABANDONED {
                    return Err(OkvmError::Timeout(format!(
                        "workspace {op} abandoned before it started"
                    )));
                }
                let ctx = Op {
                    layout: &layout,
                    name: op,
                    state: &job_state,
                };
                f(&ctx, &mut **guard)
            })
            .await
            .map_err(|e| OkvmError::Workspace(format!("{op} task failed: {e}")))?
        };
        tokio::pin!(work);
        match tokio::time::timeout(self.timeout, &mut work).await {
            Ok(result) => result,
            Err(_) => {
                if state
                    .compare_exchange(RUNNING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    tracing::warn!(workspace_id = %self.layout.id, op, "Workspace operation timed out");
                    return Err(OkvmError::Timeout(format!(
                        "{}s waiting for workspace {op}",
                        self.timeout.as_secs()
                    )));
                }
                // The change is already landing; report what actually happened.
                tracing::warn!(workspace_id = %self.layout.id, op, "Workspace operation overran its timeout");
                work.await
            }
        }
    }

    /// Writes `data` to `path`, atomically, within the quota.
    pub async fn write_file(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: WriteMode,
    ) -> OkvmResult<WriteReceipt> {
        let raw = path.to_string();
        self.run("write", move |layout, _| write_blocking(layout, &raw, &data, mode))
            .await
    }

    pub async fn read_file(&self, path: &str) -> OkvmResult<Vec<u8>> {
        let raw = path.to_string();
        self.run("read", move |layout, _| {
            let target = sandbox::resolve(&layout.root, &raw)?;
            let meta = std::fs::metadata(&target)
                .map_err(|_| OkvmError::NotFound(format!("file '{raw}'")))?;
            if meta.is_dir() {
                return Err(OkvmError::ToolExecution(format!("'{raw}' is a directory")));
            }
            Ok(std::fs::read(&target)?)
        })
        .await
    }

    /// Lists a directory, sorted by name.
    pub async fn list_directory(&self, path: &str) -> OkvmResult<Vec<DirEntry>> {
        let raw = path.to_string();
        self.run("list", move |layout, _| {
            let target = sandbox::resolve(&layout.root, &raw)?;
            if !target.is_dir() {
                return Err(OkvmError::NotFound(format!("directory '{raw}'")));
            }
            let mut entries = Vec::new();
            for entry in std::fs::read_dir(&target)? {
                let entry = entry?;
                let meta = entry.metadata()?;
                let kind = if meta.file_type().is_symlink() {
                    EntryKind::Symlink
                } else if meta.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                };
                entries.push(DirEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    path: sandbox::relative_display(&layout.root, &entry.path()),
                    kind,
                    size: if kind == EntryKind::File { meta.len() } else { 0 },
                });
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(entries)
        })
        .await
    }

    /// Removes a file or a directory tree. Returns the bytes freed.
    pub async fn delete_path(&self, path: &str) -> OkvmResult<u64> {
        let raw = path.to_string();
        self.run("delete", move |layout, _| {
            let target = sandbox::resolve(&layout.root, &raw)?;
            let canonical_root = layout.root.canonicalize()?;
            if target == canonical_root {
                return Err(OkvmError::SandboxViolation(
                    "refusing to delete the workspace root".into(),
                ));
            }
            let meta = std::fs::symlink_metadata(&target)
                .map_err(|_| OkvmError::NotFound(format!("'{raw}'")))?;
            layout.commit_point()?;
            let freed = if meta.is_dir() {
                let size = tree_usage(&target)?;
                std::fs::remove_dir_all(&target)?;
                size
            } else {
                std::fs::remove_file(&target)?;
                if meta.is_file() {
                    meta.len()
                } else {
                    0
                }
            };
            layout.set_usage(layout.usage().saturating_sub(freed));
            Ok(freed)
        })
        .await
    }

    /// Commits the current tree as a new snapshot.
    pub async fn snapshot(&self, label: Option<&str>) -> OkvmResult<Snapshot> {
        let label = normalize_label(label);
        let snap = self
            .run("snapshot", move |op, vcs| {
                op.commit_point()?;
                vcs.commit(&label)
            })
            .await?;
        tracing::info!(
            workspace_id = %self.layout.id,
            snapshot_id = %snap.id,
            label = %snap.label,
            "Snapshot created"
        );
        Ok(snap)
    }

    /// Replaces the live tree with the content of snapshot `id`.
    ///
    /// All-or-nothing: the snapshot is materialised in a staging directory
    /// first and swapped in with renames; any failure leaves the live tree
    /// as it was. The snapshot log is not rewound.
    pub async fn restore(&self, id: &str) -> OkvmResult<Snapshot> {
        let raw = id.to_string();
        let restored = self
            .run("restore", move |layout, vcs| {
                let resolved = vcs.resolve(&raw)?;
                let snapshot = vcs
                    .log(usize::MAX)?
                    .into_iter()
                    .find(|s| s.id == resolved)
                    .ok_or_else(|| OkvmError::UnknownSnapshot(raw.clone()))?;
                swap_in_snapshot(layout, vcs, &snapshot)?;
                Ok(snapshot)
            })
            .await?;
        tracing::info!(
            workspace_id = %self.layout.id,
            snapshot_id = %restored.id,
            "Snapshot restored"
        );
        Ok(restored)
    }

    /// Up to `limit` snapshots, newest first.
    pub async fn list_snapshots(&self, limit: usize) -> OkvmResult<Vec<Snapshot>> {
        self.run("list_snapshots", move |_, vcs| vcs.log(limit))
            .await
    }

    /// Usage, quota and the most recent snapshots in one consistent read.
    pub async fn state_summary(&self, limit: usize) -> OkvmResult<WorkspaceState> {
        let snapshots_enabled = self.snapshots_enabled;
        self.run("state", move |layout, vcs| {
            Ok(WorkspaceState {
                workspace_id: layout.id.clone(),
                root: layout.root.clone(),
                used_bytes: layout.usage(),
                quota_bytes: layout.quota,
                snapshots_enabled,
                snapshots: vcs.log(limit)?,
            })
        })
        .await
    }

    /// Removes the workspace directory, snapshot log included.
    ///
    /// Later operations fail with a workspace error.
    pub async fn destroy(&self) -> OkvmResult<()> {
        self.run("destroy", |layout, _| {
            layout.commit_point()?;
            layout.destroyed.store(true, Ordering::Release);
            match std::fs::remove_dir_all(&layout.dir) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await?;
        tracing::info!(workspace_id = %self.layout.id, "Workspace destroyed");
        Ok(())
    }
}

fn write_blocking(
    layout: &Op<'_>,
    raw: &str,
    data: &[u8],
    mode: WriteMode,
) -> OkvmResult<WriteReceipt> {
    let target = sandbox::resolve(&layout.root, raw)?;
    let existing = std::fs::symlink_metadata(&target).ok();
    if existing.as_ref().is_some_and(|m| m.is_dir()) {
        return Err(OkvmError::ToolExecution(format!("'{raw}' is a directory")));
    }
    let old_size = existing
        .as_ref()
        .filter(|m| m.is_file())
        .map_or(0, |m| m.len());

    let content: Vec<u8> = match mode {
        WriteMode::Append if old_size > 0 => {
            let mut buf = std::fs::read(&target)?;
            buf.extend_from_slice(data);
            buf
        }
        _ => data.to_vec(),
    };
    let new_size = content.len() as u64;
    let projected = layout.usage().saturating_sub(old_size) + new_size;
    if projected > layout.quota {
        tracing::warn!(
            workspace_id = %layout.id,
            path = %raw,
            projected,
            quota = layout.quota,
            "Write rejected by quota"
        );
        return Err(OkvmError::QuotaExceeded {
            requested: projected,
            quota: layout.quota,
        });
    }

    let mut tmp = tempfile::NamedTempFile::new_in(&layout.staging)?;
    tmp.write_all(&content)?;
    tmp.as_file().sync_all()?;
    layout.commit_point()?;
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tmp.persist(&target).map_err(|e| OkvmError::Io(e.error))?;

    layout.set_usage(projected);
    Ok(WriteReceipt {
        path: sandbox::relative_display(&layout.root, &target),
        bytes_written: data.len() as u64,
        size: new_size,
        created: existing.is_none(),
    })
}

fn swap_in_snapshot(
    layout: &Op<'_>,
    vcs: &mut dyn VersionControl,
    snapshot: &Snapshot,
) -> OkvmResult<()> {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let incoming = layout.staging.join(format!("restore-{nonce}"));
    let outgoing = layout.staging.join(format!("previous-{nonce}"));

    std::fs::create_dir_all(&incoming)?;
    if let Err(e) = vcs.checkout(&snapshot.id, &incoming) {
        let _ = std::fs::remove_dir_all(&incoming);
        return Err(e);
    }
    let usage = match tree_usage(&incoming) {
        Ok(u) => u,
        Err(e) => {
            let _ = std::fs::remove_dir_all(&incoming);
            return Err(e.into());
        }
    };

    if let Err(e) = layout.commit_point() {
        let _ = std::fs::remove_dir_all(&incoming);
        return Err(e);
    }
    if let Err(e) = std::fs::rename(&layout.root, &outgoing) {
        let _ = std::fs::remove_dir_all(&incoming);
        return Err(OkvmError::Workspace(format!("restore aborted: {e}")));
    }
    if let Err(e) = std::fs::rename(&incoming, &layout.root) {
        if let Err(back) = std::fs::rename(&outgoing, &layout.root) {
            tracing::error!(workspace_id = %layout.id, error = %back, "Failed to roll back restore");
        }
        let _ = std::fs::remove_dir_all(&incoming);
        return Err(OkvmError::Workspace(format!("restore aborted: {e}")));
    }
    if let Err(e) = std::fs::remove_dir_all(&outgoing) {
        tracing::warn!(workspace_id = %layout.id, error = %e, "Could not clean up previous tree");
    }
    layout.set_usage(usage);
    Ok(())
}

/// Sum of regular-file sizes under `root`; symlinks are not followed.
pub(crate) fn tree_usage(root: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata()?.len();
            }
        }
    }
    Ok(total)
}
