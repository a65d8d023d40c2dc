use crate::config::{SnapshotBackend, WorkspaceConfig};
use crate::vcs::{DisabledVersionControl, GitVersionControl, VersionControl};
use crate::workspace::Workspace;
use okvm_core::{OkvmError, OkvmResult};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Allocates and tears down workspaces under one base directory.
///
/// Each workspace gets `<base_dir>/<id>/` with three children: `tree`
/// (the sandbox root), `staging` (temp files and restore scratch space on
/// the same filesystem) and `vcs` (the snapshot log).
pub struct WorkspaceManager {
    config: WorkspaceConfig,
    live: Mutex<HashSet<String>>,
}

impl WorkspaceManager {
    pub fn new(config: WorkspaceConfig) -> OkvmResult<Self> {
        std::fs::create_dir_all(&config.base_dir).map_err(|e| {
            OkvmError::ResourceExhausted(format!(
                "cannot create workspace base dir {}: {e}",
                config.base_dir.display()
            ))
        })?;
        tracing::info!(
            base_dir = %config.base_dir.display(),
            durable = config.durable,
            snapshots = ?config.snapshots,
            "Workspace manager ready"
        );
        Ok(Self {
            config,
            live: Mutex::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn is_durable(&self) -> bool {
        self.config.durable
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Allocates a fresh, empty workspace.
    pub async fn create(&self, quota: Option<u64>) -> OkvmResult<Arc<Workspace>> {
        let id = Uuid::new_v4().simple().to_string();
        self.allocate(id, quota).await
    }

    /// Opens the durable workspace belonging to `key`, creating it on first use.
    ///
    /// The directory name is the SHA-256 of the key, so the same client
    /// finds its files and snapshot log again after a restart.
    pub async fn open_or_create(&self, key: &str, quota: Option<u64>) -> OkvmResult<Arc<Workspace>> {
        if !self.config.durable {
            return Err(OkvmError::Config(
                "durable workspaces are disabled; use create()".into(),
            ));
        }
        let id = hex::encode(Sha256::digest(key.as_bytes()));
        self.allocate(id, quota).await
    }

    /// Hands a workspace back.
    ///
    /// Ephemeral workspaces are destroyed. Durable ones stay on disk and
    /// are only forgotten.
    pub async fn release(&self, workspace: &Workspace) -> OkvmResult<()> {
        let forgotten = self.live.lock().remove(workspace.id());
        if !forgotten {
            return Ok(());
        }
        if self.config.durable {
            tracing::info!(workspace_id = %workspace.id(), "Durable workspace released");
            Ok(())
        } else {
            workspace.destroy().await
        }
    }

    /// Destroys a workspace whatever the durability mode.
    pub async fn purge(&self, workspace: &Workspace) -> OkvmResult<()> {
        self.live.lock().remove(workspace.id());
        workspace.destroy().await
    }

    async fn allocate(&self, id: String, quota: Option<u64>) -> OkvmResult<Arc<Workspace>> {
        self.reserve(&id)?;
        let dir = self.config.base_dir.join(&id);
        let backend = self.config.snapshots;
        let timeout = Duration::from_secs(self.config.operation_timeout_secs);
        let quota = quota.unwrap_or(self.config.default_quota_bytes);

        let alloc_id = id.clone();
        let result = tokio::task::spawn_blocking(move || {
            build_workspace(alloc_id, dir, backend, quota, timeout)
        })
        .await
        .map_err(|e| OkvmError::ResourceExhausted(format!("allocation task failed: {e}")))
        .and_then(|r| r);

        match result {
            Ok(ws) => {
                tracing::info!(workspace_id = %id, quota, "Workspace created");
                Ok(Arc::new(ws))
            }
            Err(e) => {
                self.live.lock().remove(&id);
                tracing::error!(workspace_id = %id, error = %e, "Workspace allocation failed");
                Err(e)
            }
        }
    }

    fn reserve(&self, id: &str) -> OkvmResult<()> {
        let mut live = self.live.lock();
        if live.contains(id) {
            return Err(OkvmError::Workspace(format!("workspace {id} is already open")));
        }
        if self.config.max_workspaces > 0 && live.len() >= self.config.max_workspaces {
            return Err(OkvmError::ResourceExhausted(format!(
                "workspace limit of {} reached",
                self.config.max_workspaces
            )));
        }
        live.insert(id.to_string());
        Ok(())
    }
}

fn build_workspace(
    id: String,
    dir: PathBuf,
    backend: SnapshotBackend,
    quota: u64,
    timeout: Duration,
) -> OkvmResult<Workspace> {
    let exhausted = |what: &Path, e: std::io::Error| {
        OkvmError::ResourceExhausted(format!("cannot allocate {}: {e}", what.display()))
    };
    let tree = dir.join("tree");
    let staging = dir.join("staging");
    std::fs::create_dir_all(&tree).map_err(|e| exhausted(&tree, e))?;
    // Leftovers from an interrupted restore are never part of the tree.
    if staging.exists() {
        std::fs::remove_dir_all(&staging).map_err(|e| exhausted(&staging, e))?;
    }
    std::fs::create_dir_all(&staging).map_err(|e| exhausted(&staging, e))?;
    let root = tree.canonicalize().map_err(|e| exhausted(&tree, e))?;

    let vcs: Box<dyn VersionControl> = match backend {
        SnapshotBackend::Git => Box::new(GitVersionControl::open_or_init(&dir.join("vcs"), &root)?),
        SnapshotBackend::Disabled => Box::new(DisabledVersionControl),
    };
    Workspace::new(id, dir, root, staging, quota, vcs, timeout)
}
